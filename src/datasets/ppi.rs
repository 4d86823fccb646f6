//! Protein-protein interaction rows: one canonical pair document per row,
//! overwritten when the same unordered pair shows up again.

use serde_json::{Map, Value, json};

use super::{annotation_value, enrich, row_group};
use crate::annotation::Annotations;
use crate::index::{BulkOperation, Fields};
use crate::ingest::{RowTransform, Transformed};
use crate::keys::{canonical_pair, pair_id};
use crate::source::Row;

pub const PROTEIN_A: &[&str] = &["protein_a", "protein1", "interactor_a", "participant_a"];
pub const PROTEIN_B: &[&str] = &["protein_b", "protein2", "interactor_b", "participant_b"];
pub const XREF_A: &[&str] = &["uniprot_a", "xref_a", "alias_a"];
pub const XREF_B: &[&str] = &["uniprot_b", "xref_b", "alias_b"];

pub const DEFAULT_SCORE_COLUMNS: &[&str] = &[
    "score",
    "combined_score",
    "neighborhood",
    "fusion",
    "cooccurence",
    "coexpression",
    "experimental",
    "database",
    "textmining",
];

pub const MISSING_PARTICIPANTS: &str = "missing participant column";

pub struct PpiTransform<'a> {
    annotations: Option<&'a dyn Annotations>,
    score_columns: Vec<String>,
    default_namespace: String,
}

impl<'a> PpiTransform<'a> {
    pub fn new(annotations: Option<&'a dyn Annotations>) -> Self {
        Self {
            annotations,
            score_columns: DEFAULT_SCORE_COLUMNS.iter().map(|c| c.to_string()).collect(),
            default_namespace: "ppi".to_string(),
        }
    }

    pub fn with_score_columns(mut self, columns: Vec<String>) -> Self {
        self.score_columns = columns;
        self
    }

    /// Builds the pair document, or the reason the row is dropped.
    pub fn pair_document(&self, row: &Row) -> Result<(String, Fields), &'static str> {
        let (Some(a), Some(b)) = (row.first_of(PROTEIN_A), row.first_of(PROTEIN_B)) else {
            return Err(MISSING_PARTICIPANTS);
        };
        let group = row_group(row);
        let namespace = group
            .as_ref()
            .map(|g| g.as_str())
            .unwrap_or(self.default_namespace.as_str());
        let (low, high) = canonical_pair(a, b);
        let swapped = low != a;
        let (xref_low, xref_high) = {
            let (xa, xb) = (row.first_of(XREF_A), row.first_of(XREF_B));
            if swapped { (xb, xa) } else { (xa, xb) }
        };
        let id = pair_id(namespace, a, b);

        let mut scores = Map::new();
        for column in &self.score_columns {
            if let Some(value) = row.number(&[column.as_str()]) {
                scores.insert(column.clone(), json!(value));
            }
        }

        let annotation_low = enrich(self.annotations, group.as_ref(), low);
        let annotation_high = enrich(self.annotations, group.as_ref(), high);

        let mut document = Fields::new();
        document.insert("id".to_string(), json!(id));
        document.insert("isolate".to_string(), json!(group.as_ref().map(|g| g.as_str())));
        document.insert("protein_a".to_string(), json!(low));
        document.insert("protein_b".to_string(), json!(high));
        document.insert("xref_a".to_string(), json!(xref_low));
        document.insert("xref_b".to_string(), json!(xref_high));
        document.insert("is_self_interaction".to_string(), json!(a == b));
        document.insert("scores".to_string(), Value::Object(scores));
        document.insert(
            "protein_a_annotation".to_string(),
            annotation_value(annotation_low.as_deref()),
        );
        document.insert(
            "protein_b_annotation".to_string(),
            annotation_value(annotation_high.as_deref()),
        );
        Ok((id, document))
    }
}

impl RowTransform for PpiTransform<'_> {
    fn transform(&self, row: &Row) -> Transformed {
        match self.pair_document(row) {
            Ok((id, document)) => Transformed::Op(BulkOperation::Index { id, document }),
            Err(reason) => Transformed::Skip(reason),
        }
    }
}

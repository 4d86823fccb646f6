//! Per-gene essentiality calls. Each call is appended to the gene's document
//! unless an identical call is already recorded, so repeated imports of the
//! same run never duplicate entries.

use serde_json::{Value, json};

use super::{enrich, row_group};
use crate::annotation::Annotations;
use crate::append::append_operation;
use crate::index::Fields;
use crate::ingest::{RowTransform, Transformed};
use crate::source::{Row, parse_flag};

pub const FEATURE: &[&str] = &["locus_tag", "feature_id", "gene_id", "gene"];
pub const CONDITION: &[&str] = &["condition", "medium", "growth_condition"];
pub const CALL: &[&str] = &["call", "essentiality", "essential"];
pub const READS: &[&str] = &["reads", "read_count", "count"];
pub const INSERTIONS: &[&str] = &["insertions", "insertion_count", "unique_insertions"];
pub const METHOD: &[&str] = &["method", "tool"];

pub const COLLECTION: &str = "essentiality";
pub const DEDUP_KEYS: &[&str] = &["condition", "call", "reads", "insertions"];

pub const MISSING_FEATURE: &str = "missing feature column";
pub const MISSING_CALL: &str = "missing condition or call";

/// `essential` / `non-essential` for boolean-style calls, otherwise the
/// lowercased label (e.g. `ambiguous`, `growth-defect`).
pub fn normalize_call(value: &str) -> String {
    match parse_flag(value) {
        Some(true) => "essential".to_string(),
        Some(false) => "non-essential".to_string(),
        None => value.trim().to_ascii_lowercase().replace([' ', '_'], "-"),
    }
}

pub struct EssentialityTransform<'a> {
    annotations: Option<&'a dyn Annotations>,
    feature_type: String,
}

impl<'a> EssentialityTransform<'a> {
    pub fn new(annotations: Option<&'a dyn Annotations>) -> Self {
        Self {
            annotations,
            feature_type: "gene".to_string(),
        }
    }

    pub fn with_feature_type(mut self, feature_type: &str) -> Self {
        self.feature_type = feature_type.to_string();
        self
    }

    /// Document id, base fields and entry for one row, or why it is dropped.
    pub fn parts(&self, row: &Row) -> Result<(String, Fields, Fields), &'static str> {
        let Some(feature) = row.first_of(FEATURE) else {
            return Err(MISSING_FEATURE);
        };
        let (Some(condition), Some(call)) = (row.first_of(CONDITION), row.first_of(CALL)) else {
            return Err(MISSING_CALL);
        };
        let group = row_group(row);
        let id = match group.as_ref() {
            Some(group) => format!("{group}:{feature}"),
            None => feature.to_string(),
        };

        let mut base = Fields::new();
        base.insert("feature_id".to_string(), json!(feature));
        base.insert("feature_type".to_string(), json!(self.feature_type));
        if let Some(group) = group.as_ref() {
            base.insert("isolate".to_string(), json!(group.as_str()));
        }
        if let Some(record) = enrich(self.annotations, group.as_ref(), feature) {
            let descriptive = [
                ("name", record.name.clone().map(Value::from)),
                ("product", record.product.clone().map(Value::from)),
                ("alt_id", record.alt_id.clone().map(Value::from)),
                ("seqid", Some(Value::from(record.seqid.clone()))),
                ("start", Some(json!(record.start))),
                ("end", Some(json!(record.end))),
            ];
            for (field, value) in descriptive {
                if let Some(value) = value {
                    base.insert(field.to_string(), value);
                }
            }
        }

        let mut entry = Fields::new();
        entry.insert("condition".to_string(), json!(condition));
        entry.insert("call".to_string(), json!(normalize_call(call)));
        entry.insert("reads".to_string(), json!(row.integer(READS)));
        entry.insert("insertions".to_string(), json!(row.integer(INSERTIONS)));
        entry.insert("method".to_string(), json!(row.first_of(METHOD)));
        Ok((id, base, entry))
    }
}

impl RowTransform for EssentialityTransform<'_> {
    fn transform(&self, row: &Row) -> Transformed {
        match self.parts(row) {
            Ok((id, base, entry)) => {
                Transformed::Op(append_operation(&id, base, COLLECTION, entry, DEDUP_KEYS))
            }
            Err(reason) => Transformed::Skip(reason),
        }
    }
}

//! Column contracts for the supported ingestion kinds.

pub mod essentiality;
pub mod operon;
pub mod ppi;

use std::sync::Arc;

use serde_json::{Value, json};

use crate::annotation::Annotations;
use crate::domain::{AnnotationRecord, GroupId};
use crate::source::Row;

/// Columns naming the isolate / genome a row belongs to.
pub const GROUP_COLUMNS: &[&str] = &["isolate", "isolate_id", "genome_id", "group", "sample"];

pub fn row_group(row: &Row) -> Option<GroupId> {
    row.first_of(GROUP_COLUMNS)
        .and_then(|value| value.parse().ok())
}

/// Looks up `identifier` when both a group and an annotation source exist.
pub fn enrich(
    annotations: Option<&dyn Annotations>,
    group: Option<&GroupId>,
    identifier: &str,
) -> Option<Arc<AnnotationRecord>> {
    annotations?.annotation(group?, identifier)
}

/// Enrichment block copied into documents, `null` when nothing was found.
pub fn annotation_value(record: Option<&AnnotationRecord>) -> Value {
    match record {
        Some(record) => json!({
            "locus_tag": record.id,
            "alt_id": record.alt_id,
            "name": record.name,
            "product": record.product,
            "seqid": record.seqid,
            "start": record.start,
            "end": record.end,
            "strand": record.strand,
        }),
        None => Value::Null,
    }
}

//! Document store collaborator: bulk writes, index settings and refresh.

mod elastic;
mod memory;

pub use elastic::{ElasticIndex, bulk_body};
pub use memory::MemoryIndex;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GenodexError;

pub type Fields = Map<String, Value>;

/// How long a bulk call blocks before its writes are searchable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// Force a refresh of the affected shards.
    Immediate,
    /// Return once the next scheduled refresh has made the writes visible.
    WaitFor,
    #[default]
    BestEffort,
}

impl Visibility {
    pub fn as_refresh_param(self) -> &'static str {
        match self {
            Visibility::Immediate => "true",
            Visibility::WaitFor => "wait_for",
            Visibility::BestEffort => "false",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Visibility::Immediate => write!(f, "immediate"),
            Visibility::WaitFor => write!(f, "wait-for"),
            Visibility::BestEffort => write!(f, "best-effort"),
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "immediate" | "true" => Ok(Visibility::Immediate),
            "wait-for" | "wait_for" | "deferred" => Ok(Visibility::WaitFor),
            "best-effort" | "false" | "none" => Ok(Visibility::BestEffort),
            other => Err(format!("unknown visibility: {other}")),
        }
    }
}

/// Conditional partial update that appends `entry` to the nested `collection`
/// unless an entry with equal values at every `dedup_keys` field exists.
/// `base_fields` are written only where the document lacks them.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEntry {
    pub base_fields: Fields,
    pub collection: String,
    pub entry: Fields,
    pub dedup_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOperation {
    /// Unconditional overwrite.
    Index { id: String, document: Fields },
    Append { id: String, append: AppendEntry },
}

impl BulkOperation {
    pub fn id(&self) -> &str {
        match self {
            BulkOperation::Index { id, .. } | BulkOperation::Append { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Created,
    Updated,
    /// The conditional update matched an existing entry and changed nothing.
    Noop,
    Failed { status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItem {
    pub id: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItem>,
}

impl BulkResponse {
    pub fn failures(&self) -> impl Iterator<Item = &BulkItem> {
        self.items
            .iter()
            .filter(|item| matches!(item.outcome, ItemOutcome::Failed { .. }))
    }

    pub fn succeeded(&self) -> usize {
        self.items.len() - self.failures().count()
    }

    pub fn noops(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.outcome == ItemOutcome::Noop)
            .count()
    }
}

/// Near-real-time settings relaxed during bulk loads. `None` means the
/// store default (the setting is unset on the index).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub refresh_interval: Option<String>,
    pub number_of_replicas: Option<u32>,
}

impl IndexSettings {
    pub fn bulk_load() -> Self {
        Self {
            refresh_interval: Some("-1".to_string()),
            number_of_replicas: Some(0),
        }
    }
}

pub trait IndexWriter {
    fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        visibility: Visibility,
    ) -> Result<BulkResponse, GenodexError>;
    fn settings(&self, index: &str) -> Result<IndexSettings, GenodexError>;
    fn put_settings(&self, index: &str, settings: &IndexSettings) -> Result<(), GenodexError>;
    fn refresh(&self, index: &str) -> Result<(), GenodexError>;
}

impl<W: IndexWriter + ?Sized> IndexWriter for &W {
    fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        visibility: Visibility,
    ) -> Result<BulkResponse, GenodexError> {
        (**self).bulk(index, operations, visibility)
    }

    fn settings(&self, index: &str) -> Result<IndexSettings, GenodexError> {
        (**self).settings(index)
    }

    fn put_settings(&self, index: &str, settings: &IndexSettings) -> Result<(), GenodexError> {
        (**self).put_settings(index, settings)
    }

    fn refresh(&self, index: &str) -> Result<(), GenodexError> {
        (**self).refresh(index)
    }
}

/// Applies the append-with-dedup rule to a document body in place.
/// Returns `true` when anything changed.
pub fn apply_append(document: &mut Fields, append: &AppendEntry) -> bool {
    let mut changed = false;
    for (key, value) in &append.base_fields {
        let missing = document.get(key).map(Value::is_null).unwrap_or(true);
        if missing {
            document.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    let collection = document
        .entry(append.collection.clone())
        .or_insert_with(|| {
            changed = true;
            Value::Array(Vec::new())
        });
    if !collection.is_array() {
        *collection = Value::Array(Vec::new());
        changed = true;
    }
    if let Value::Array(entries) = collection {
        let duplicate = entries.iter().any(|existing| {
            append.dedup_keys.iter().all(|key| {
                existing.get(key).unwrap_or(&Value::Null)
                    == append.entry.get(key).unwrap_or(&Value::Null)
            })
        });
        if !duplicate {
            entries.push(Value::Object(append.entry.clone()));
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[test]
    fn append_keeps_populated_base_fields() {
        let mut document = fields(json!({"feature_id": "F1", "product": "kept"}));
        let append = AppendEntry {
            base_fields: fields(json!({"product": "ignored", "feature_type": "gene"})),
            collection: "calls".to_string(),
            entry: fields(json!({"condition": "LB", "call": "essential"})),
            dedup_keys: vec!["condition".to_string(), "call".to_string()],
        };
        assert!(apply_append(&mut document, &append));
        assert_eq!(document["product"], "kept");
        assert_eq!(document["feature_type"], "gene");
        assert!(!apply_append(&mut document, &append));
        assert_eq!(document["calls"].as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn visibility_parses_aliases() {
        assert_eq!("deferred".parse::<Visibility>(), Ok(Visibility::WaitFor));
        assert_eq!(Visibility::Immediate.as_refresh_param(), "true");
    }
}

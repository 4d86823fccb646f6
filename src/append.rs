//! Idempotent append-only upserts for documents that accrue entries over
//! independent import runs.

use crate::error::GenodexError;
use crate::index::{AppendEntry, BulkOperation, Fields, IndexWriter, ItemOutcome, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The document did not exist and was created with the entry.
    Created,
    /// The entry was appended or missing base fields were filled in.
    Updated,
    /// An entry with the same dedup-key values was already present.
    Unchanged,
}

/// Builds the conditional update for `feature_id`.
pub fn append_operation(
    feature_id: &str,
    base_fields: Fields,
    collection: &str,
    entry: Fields,
    dedup_keys: &[&str],
) -> BulkOperation {
    BulkOperation::Append {
        id: feature_id.to_string(),
        append: AppendEntry {
            base_fields,
            collection: collection.to_string(),
            entry,
            dedup_keys: dedup_keys.iter().map(|key| key.to_string()).collect(),
        },
    }
}

pub struct AppendUpsert<'a, W: IndexWriter> {
    writer: &'a W,
    index: String,
    collection: String,
    visibility: Visibility,
}

impl<'a, W: IndexWriter> AppendUpsert<'a, W> {
    pub fn new(writer: &'a W, index: &str, collection: &str) -> Self {
        Self {
            writer,
            index: index.to_string(),
            collection: collection.to_string(),
            visibility: Visibility::BestEffort,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// One conditional update: create the document from `base_fields` if
    /// absent, fill base fields that are unset, and append `entry` unless an
    /// entry with equal values at every `dedup_keys` field already exists.
    pub fn upsert(
        &self,
        feature_id: &str,
        base_fields: Fields,
        entry: Fields,
        dedup_keys: &[&str],
    ) -> Result<UpsertOutcome, GenodexError> {
        let operation = append_operation(
            feature_id,
            base_fields,
            &self.collection,
            entry,
            dedup_keys,
        );
        let response = self
            .writer
            .bulk(&self.index, std::slice::from_ref(&operation), self.visibility)?;
        let item = response
            .items
            .into_iter()
            .next()
            .ok_or_else(|| GenodexError::IndexHttp("empty bulk response".to_string()))?;
        match item.outcome {
            ItemOutcome::Created => Ok(UpsertOutcome::Created),
            ItemOutcome::Updated => Ok(UpsertOutcome::Updated),
            ItemOutcome::Noop => Ok(UpsertOutcome::Unchanged),
            ItemOutcome::Failed { status, reason } => Err(GenodexError::IndexStatus {
                status,
                message: format!("{}: {reason}", item.id),
            }),
        }
    }
}

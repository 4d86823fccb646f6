//! Two-phase aggregation of many rows into one document per entity key.
//!
//! Rows are folded into in-memory entities while the input is read
//! (`Accumulating`). Once the input is exhausted the builder is finalized,
//! which resolves inferred categories by majority vote, and then flushed to
//! the index with unconditional overwrites.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::GenodexError;
use crate::index::{BulkOperation, Fields, IndexWriter};
use crate::ingest::{BatchWriter, IngestOptions, RelaxedSettings, WriteStats};
use crate::keys::derived_entity_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Accumulating,
    Finalized,
    Flushed,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Empty => "empty",
            Phase::Accumulating => "accumulating",
            Phase::Finalized => "finalized",
            Phase::Flushed => "flushed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata for one named participant slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParticipantDetail {
    pub id: String,
    pub alt_id: Option<String>,
    pub name: Option<String>,
    pub product: Option<String>,
    pub seqid: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub strand: Option<char>,
}

/// What a single row says about its entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityContribution {
    pub explicit_key: Option<String>,
    /// Boundary participants, used to derive the key when none is explicit.
    pub boundary: Option<(String, String)>,
    pub participants: Vec<String>,
    pub first: Option<ParticipantDetail>,
    pub second: Option<ParticipantDetail>,
    /// Scalar details; the first value seen for a field is kept.
    pub details: Vec<(String, Value)>,
    /// Values unioned into list fields, insertion ordered.
    pub lists: Vec<(String, String)>,
    /// Boolean rollups; OR-ed across rows.
    pub flags: Vec<(String, bool)>,
    pub explicit_category: Option<String>,
    pub inferred_category: Option<String>,
}

impl EntityContribution {
    pub fn entity_key(&self) -> Option<String> {
        if let Some(key) = self.explicit_key.as_deref().map(str::trim) {
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }
        self.boundary
            .as_ref()
            .map(|(a, b)| derived_entity_id(a, b))
    }
}

/// Field names used when rendering an entity as a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    pub participants_field: String,
    pub count_field: String,
    pub category_field: String,
    pub first_field: String,
    pub second_field: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEntity {
    pub id: String,
    pub participants: Vec<String>,
    pub first: Option<ParticipantDetail>,
    pub second: Option<ParticipantDetail>,
    pub details: IndexMap<String, Value>,
    pub lists: IndexMap<String, Vec<String>>,
    pub flags: IndexMap<String, bool>,
    pub category: Option<String>,
    pub participant_count: usize,
    pub rows: u64,
    #[serde(skip)]
    explicit_category: Option<String>,
    #[serde(skip)]
    inferred_counts: IndexMap<String, usize>,
}

impl AggregatedEntity {
    fn new(id: String) -> Self {
        Self {
            id,
            participants: Vec::new(),
            first: None,
            second: None,
            details: IndexMap::new(),
            lists: IndexMap::new(),
            flags: IndexMap::new(),
            category: None,
            participant_count: 0,
            rows: 0,
            explicit_category: None,
            inferred_counts: IndexMap::new(),
        }
    }

    fn apply(&mut self, contribution: EntityContribution) {
        self.rows += 1;
        for participant in contribution.participants {
            if !participant.is_empty() && !self.participants.contains(&participant) {
                self.participants.push(participant);
            }
        }
        if self.first.is_none() {
            self.first = contribution.first;
        }
        if self.second.is_none() {
            self.second = contribution.second;
        }
        for (field, value) in contribution.details {
            if !value.is_null() {
                self.details.entry(field).or_insert(value);
            }
        }
        for (field, value) in contribution.lists {
            let values = self.lists.entry(field).or_default();
            if !values.contains(&value) {
                values.push(value);
            }
        }
        for (field, value) in contribution.flags {
            let flag = self.flags.entry(field).or_insert(false);
            *flag = *flag || value;
        }
        if self.explicit_category.is_none() {
            self.explicit_category = contribution.explicit_category;
        }
        if let Some(inferred) = contribution.inferred_category {
            *self.inferred_counts.entry(inferred).or_default() += 1;
        }
    }

    fn finalize(&mut self) {
        self.category = self
            .explicit_category
            .clone()
            .or_else(|| majority(&self.inferred_counts));
        self.participant_count = self.participants.len();
    }

    pub fn to_document(&self, schema: &EntitySchema) -> Fields {
        let mut document = Fields::new();
        document.insert("id".to_string(), json!(self.id));
        document.insert(schema.participants_field.clone(), json!(self.participants));
        document.insert(schema.count_field.clone(), json!(self.participant_count));
        document.insert(schema.category_field.clone(), json!(self.category));
        document.insert(schema.first_field.clone(), json!(self.first));
        document.insert(schema.second_field.clone(), json!(self.second));
        for (field, value) in &self.details {
            document.insert(field.clone(), value.clone());
        }
        for (field, values) in &self.lists {
            document.insert(field.clone(), json!(values));
        }
        for (field, flag) in &self.flags {
            document.insert(field.clone(), json!(flag));
        }
        document.insert("row_count".to_string(), json!(self.rows));
        document
    }
}

/// Highest count wins; ties go to the value seen first.
pub fn majority(counts: &IndexMap<String, usize>) -> Option<String> {
    let mut best: Option<(&String, usize)> = None;
    for (value, count) in counts {
        match best {
            Some((_, best_count)) if *count <= best_count => {}
            _ => best = Some((value, *count)),
        }
    }
    best.map(|(value, _)| value.clone())
}

pub struct EntityAccumulator {
    schema: EntitySchema,
    phase: Phase,
    entities: IndexMap<String, AggregatedEntity>,
    skipped: u64,
}

impl EntityAccumulator {
    pub fn new(schema: EntitySchema) -> Self {
        Self {
            schema,
            phase: Phase::Empty,
            entities: IndexMap::new(),
            skipped: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Rows dropped because no entity key could be resolved or derived.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&AggregatedEntity> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &AggregatedEntity> {
        self.entities.values()
    }

    pub fn documents(&self) -> impl Iterator<Item = Fields> + '_ {
        self.entities
            .values()
            .map(|entity| entity.to_document(&self.schema))
    }

    /// Folds one row into its entity. Returns `false` when the row was
    /// dropped for lack of a key.
    pub fn accumulate(&mut self, contribution: EntityContribution) -> Result<bool, GenodexError> {
        if !matches!(self.phase, Phase::Empty | Phase::Accumulating) {
            return Err(self.invalid("accumulate rows"));
        }
        self.phase = Phase::Accumulating;
        let Some(key) = contribution.entity_key() else {
            self.skipped += 1;
            return Ok(false);
        };
        self.entities
            .entry(key.clone())
            .or_insert_with(|| AggregatedEntity::new(key))
            .apply(contribution);
        Ok(true)
    }

    pub fn finalize(&mut self) -> Result<(), GenodexError> {
        if !matches!(self.phase, Phase::Empty | Phase::Accumulating) {
            return Err(self.invalid("finalize"));
        }
        for entity in self.entities.values_mut() {
            entity.finalize();
        }
        self.phase = Phase::Finalized;
        debug!(entities = self.entities.len(), "entities finalized");
        Ok(())
    }

    /// Writes every finalized entity with unconditional overwrites. With
    /// `clear`, the in-memory entities are dropped afterwards.
    pub fn flush<W: IndexWriter>(
        &mut self,
        writer: &W,
        options: &IngestOptions,
        clear: bool,
    ) -> Result<WriteStats, GenodexError> {
        if self.phase != Phase::Finalized {
            return Err(self.invalid("flush"));
        }
        let guard = if options.optimize_writes {
            Some(RelaxedSettings::apply(writer, &options.index)?)
        } else {
            None
        };
        let mut batch = BatchWriter::new(
            writer,
            &options.index,
            options.batch_size,
            options.visibility,
        );
        for entity in self.entities.values() {
            batch.push(BulkOperation::Index {
                id: entity.id.clone(),
                document: entity.to_document(&self.schema),
            });
        }
        let stats = batch.finish();
        if let Some(guard) = guard {
            guard.restore()?;
        }
        self.phase = Phase::Flushed;
        if clear {
            self.entities.clear();
        }
        info!(
            index = %options.index,
            indexed = stats.indexed,
            failed = stats.failed,
            "aggregated entities flushed"
        );
        Ok(stats)
    }

    fn invalid(&self, action: &'static str) -> GenodexError {
        GenodexError::InvalidPhase {
            current: self.phase.name(),
            action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_prefers_first_seen_on_tie() {
        let mut counts = IndexMap::new();
        counts.insert("XX".to_string(), 2);
        counts.insert("BU".to_string(), 2);
        assert_eq!(majority(&counts).as_deref(), Some("XX"));
        counts.insert("BU".to_string(), 3);
        assert_eq!(majority(&counts).as_deref(), Some("BU"));
        assert_eq!(majority(&IndexMap::new()), None);
    }

    #[test]
    fn explicit_key_beats_boundary() {
        let contribution = EntityContribution {
            explicit_key: Some(" O1 ".to_string()),
            boundary: Some(("G2".to_string(), "G1".to_string())),
            ..EntityContribution::default()
        };
        assert_eq!(contribution.entity_key().as_deref(), Some("O1"));
        let derived = EntityContribution {
            explicit_key: Some(String::new()),
            boundary: Some(("G2".to_string(), "G1".to_string())),
            ..EntityContribution::default()
        };
        assert_eq!(derived.entity_key().as_deref(), Some("G1__G2"));
    }
}

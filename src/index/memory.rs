use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use super::{
    BulkItem, BulkOperation, BulkResponse, Fields, IndexSettings, IndexWriter, ItemOutcome,
    Visibility, apply_append,
};
use crate::error::GenodexError;

#[derive(Debug, Default)]
struct MemoryState {
    indices: BTreeMap<String, BTreeMap<String, Fields>>,
    settings: BTreeMap<String, IndexSettings>,
    settings_history: Vec<IndexSettings>,
    bulk_calls: usize,
    refreshes: usize,
    rejected_ids: HashSet<String>,
    unreachable: bool,
}

/// In-process document store with the same write semantics as the
/// Elasticsearch client. Backs `--dry-run` and the test suite.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<MemoryState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(self, index: &str, settings: IndexSettings) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.settings.insert(index.to_string(), settings);
        }
        self
    }

    /// Every write of a document with this id is rejected.
    pub fn reject_id(&self, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected_ids.insert(id.to_string());
        }
    }

    /// Makes every call fail as if the store were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable = unreachable;
        }
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Fields> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.indices.get(index)?.get(id).cloned())
    }

    pub fn documents(&self, index: &str) -> BTreeMap<String, Fields> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.indices.get(index).cloned())
            .unwrap_or_default()
    }

    pub fn len(&self, index: &str) -> usize {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.indices.get(index).map(BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, index: &str) -> bool {
        self.len(index) == 0
    }

    pub fn bulk_calls(&self) -> usize {
        self.state.lock().map(|state| state.bulk_calls).unwrap_or(0)
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().map(|state| state.refreshes).unwrap_or(0)
    }

    /// Every settings value written, oldest first.
    pub fn settings_history(&self) -> Vec<IndexSettings> {
        self.state
            .lock()
            .map(|state| state.settings_history.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, GenodexError> {
        let state = self
            .state
            .lock()
            .map_err(|_| GenodexError::IndexHttp("memory index lock poisoned".to_string()))?;
        if state.unreachable {
            return Err(GenodexError::IndexHttp("connection refused".to_string()));
        }
        Ok(state)
    }
}

impl IndexWriter for MemoryIndex {
    fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
        visibility: Visibility,
    ) -> Result<BulkResponse, GenodexError> {
        let mut state = self.lock()?;
        state.bulk_calls += 1;
        if visibility == Visibility::Immediate {
            state.refreshes += 1;
        }
        let rejected = state.rejected_ids.clone();
        let documents = state.indices.entry(index.to_string()).or_default();
        let mut items = Vec::with_capacity(operations.len());
        for operation in operations {
            let id = operation.id().to_string();
            if rejected.contains(&id) {
                items.push(BulkItem {
                    id,
                    outcome: ItemOutcome::Failed {
                        status: 400,
                        reason: "document rejected".to_string(),
                    },
                });
                continue;
            }
            let outcome = match operation {
                BulkOperation::Index { document, .. } => {
                    match documents.insert(id.clone(), document.clone()) {
                        Some(_) => ItemOutcome::Updated,
                        None => ItemOutcome::Created,
                    }
                }
                BulkOperation::Append { append, .. } => match documents.get_mut(&id) {
                    Some(existing) => {
                        if apply_append(existing, append) {
                            ItemOutcome::Updated
                        } else {
                            ItemOutcome::Noop
                        }
                    }
                    None => {
                        let mut created = Fields::new();
                        apply_append(&mut created, append);
                        documents.insert(id.clone(), created);
                        ItemOutcome::Created
                    }
                },
            };
            items.push(BulkItem { id, outcome });
        }
        Ok(BulkResponse { items })
    }

    fn settings(&self, index: &str) -> Result<IndexSettings, GenodexError> {
        let state = self.lock()?;
        Ok(state.settings.get(index).cloned().unwrap_or_default())
    }

    fn put_settings(&self, index: &str, settings: &IndexSettings) -> Result<(), GenodexError> {
        let mut state = self.lock()?;
        state.settings.insert(index.to_string(), settings.clone());
        state.settings_history.push(settings.clone());
        Ok(())
    }

    fn refresh(&self, _index: &str) -> Result<(), GenodexError> {
        let mut state = self.lock()?;
        state.refreshes += 1;
        Ok(())
    }
}

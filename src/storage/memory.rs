//! In-memory storage backend.
//!
//! Thread-safe implementation of [`CounterStore`]. Ids are handed out from a
//! monotonically increasing sequence and never reused, matching what a database
//! backed implementation would do with serial keys.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::condition::Condition;
use crate::counter::{CounterId, ScopeKey, TriggerId};
use crate::storage::traits::{CounterStore, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterIdentity {
    name: String,
    per_channel: bool,
    per_user: bool,
}

#[derive(Debug, Clone)]
struct CounterRow {
    to_be_deleted: bool,
}

#[derive(Debug, Clone)]
struct TriggerRow {
    condition: Condition,
    reverse_condition: Condition,
    to_be_deleted: bool,
}

#[derive(Debug, Default)]
struct StoreState {
    next_id: i64,
    counters: BTreeMap<CounterId, CounterRow>,
    counters_by_identity: HashMap<CounterIdentity, CounterId>,
    triggers: BTreeMap<TriggerId, TriggerRow>,
    triggers_by_name: HashMap<(CounterId, String), TriggerId>,
    values: HashMap<ScopeKey, i64>,
    cursors: HashMap<ScopeKey, DateTime<Utc>>,
}

impl StoreState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory [`CounterStore`].
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    state: RwLock<StoreState>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a counter row is currently marked for deletion.
    pub fn is_counter_marked_for_deletion(&self, id: CounterId) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("counter.marked"))?;
        state
            .counters
            .get(&id)
            .map(|row| row.to_be_deleted)
            .ok_or(StorageError::CounterNotFound(id))
    }

    /// Whether a trigger row is currently marked for deletion.
    pub fn is_trigger_marked_for_deletion(&self, id: TriggerId) -> Result<bool, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger.marked"))?;
        state
            .triggers
            .get(&id)
            .map(|row| row.to_be_deleted)
            .ok_or_else(|| StorageError::BackendError(format!("trigger not found: {id}")))
    }

    /// Stored conditions of a trigger row.
    pub fn trigger_conditions(&self, id: TriggerId) -> Result<Option<(Condition, Condition)>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("trigger.conditions"))?;
        Ok(state
            .triggers
            .get(&id)
            .map(|row| (row.condition, row.reverse_condition)))
    }
}

impl CounterStore for InMemoryCounterStore {
    fn find_or_create_counter(
        &self,
        name: &str,
        per_channel: bool,
        per_user: bool,
    ) -> Result<CounterId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("counter.find_or_create"))?;
        let identity = CounterIdentity {
            name: name.to_string(),
            per_channel,
            per_user,
        };

        if let Some(id) = state.counters_by_identity.get(&identity).copied() {
            if let Some(row) = state.counters.get_mut(&id) {
                row.to_be_deleted = false;
            }
            return Ok(id);
        }

        let id = CounterId::new(state.allocate_id());
        state.counters_by_identity.insert(identity, id);
        state.counters.insert(id, CounterRow { to_be_deleted: false });
        Ok(id)
    }

    fn init_trigger(
        &self,
        counter_id: CounterId,
        name: &str,
        condition: Condition,
        reverse_condition: Condition,
    ) -> Result<TriggerId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trigger.init"))?;
        if !state.counters.contains_key(&counter_id) {
            return Err(StorageError::CounterNotFound(counter_id));
        }

        let key = (counter_id, name.to_string());
        if let Some(id) = state.triggers_by_name.get(&key).copied() {
            if let Some(row) = state.triggers.get_mut(&id) {
                row.condition = condition;
                row.reverse_condition = reverse_condition;
                row.to_be_deleted = false;
            }
            return Ok(id);
        }

        let id = TriggerId::new(state.allocate_id());
        state.triggers_by_name.insert(key, id);
        state.triggers.insert(
            id,
            TriggerRow {
                condition,
                reverse_condition,
                to_be_deleted: false,
            },
        );
        Ok(id)
    }

    fn mark_unused_counters_to_be_deleted(&self, active: &[CounterId]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("counter.mark_unused"))?;
        let active: HashSet<CounterId> = active.iter().copied().collect();
        for (id, row) in &mut state.counters {
            row.to_be_deleted = !active.contains(id);
        }
        Ok(())
    }

    fn mark_unused_triggers_to_be_deleted(&self, active: &[TriggerId]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("trigger.mark_unused"))?;
        let active: HashSet<TriggerId> = active.iter().copied().collect();
        for (id, row) in &mut state.triggers {
            row.to_be_deleted = !active.contains(id);
        }
        Ok(())
    }

    fn get_value(&self, scope: &ScopeKey) -> Result<Option<i64>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("value.get"))?;
        Ok(state.values.get(scope).copied())
    }

    fn set_value(&self, scope: &ScopeKey, value: i64) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("value.set"))?;
        if !state.counters.contains_key(&scope.counter_id) {
            return Err(StorageError::CounterNotFound(scope.counter_id));
        }
        state.values.insert(scope.clone(), value);
        Ok(())
    }

    fn list_scopes(&self, counter_id: CounterId) -> Result<Vec<ScopeKey>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("value.list_scopes"))?;
        let mut scopes: Vec<ScopeKey> = state
            .values
            .keys()
            .filter(|k| k.counter_id == counter_id)
            .cloned()
            .collect();
        scopes.sort();
        Ok(scopes)
    }

    fn load_decay_cursor(&self, scope: &ScopeKey) -> Result<Option<DateTime<Utc>>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("cursor.load"))?;
        Ok(state.cursors.get(scope).copied())
    }

    fn save_decay_cursor(&self, scope: &ScopeKey, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("cursor.save"))?;
        state.cursors.insert(scope.clone(), at);
        Ok(())
    }
}

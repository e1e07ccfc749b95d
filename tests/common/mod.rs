#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use kyrocount::{Condition, CounterId, CounterStore, InMemoryCounterStore, ScopeKey, StorageError, TriggerId};

/// In-memory store with switchable failures and an optional delay on the
/// calls a decay scan makes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryCounterStore,
    pub fail_writes: AtomicBool,
    pub fail_list_scopes: AtomicBool,
    pub delay_ms: AtomicU64,
}

impl FlakyStore {
    fn pause(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms));
        }
    }
}

impl CounterStore for FlakyStore {
    fn find_or_create_counter(&self, name: &str, per_channel: bool, per_user: bool) -> Result<CounterId, StorageError> {
        self.inner.find_or_create_counter(name, per_channel, per_user)
    }

    fn init_trigger(
        &self,
        counter_id: CounterId,
        name: &str,
        condition: Condition,
        reverse_condition: Condition,
    ) -> Result<TriggerId, StorageError> {
        self.inner.init_trigger(counter_id, name, condition, reverse_condition)
    }

    fn mark_unused_counters_to_be_deleted(&self, active: &[CounterId]) -> Result<(), StorageError> {
        self.inner.mark_unused_counters_to_be_deleted(active)
    }

    fn mark_unused_triggers_to_be_deleted(&self, active: &[TriggerId]) -> Result<(), StorageError> {
        self.inner.mark_unused_triggers_to_be_deleted(active)
    }

    fn get_value(&self, scope: &ScopeKey) -> Result<Option<i64>, StorageError> {
        self.inner.get_value(scope)
    }

    fn set_value(&self, scope: &ScopeKey, value: i64) -> Result<(), StorageError> {
        self.pause();
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("write refused".to_string()));
        }
        self.inner.set_value(scope, value)
    }

    fn list_scopes(&self, counter_id: CounterId) -> Result<Vec<ScopeKey>, StorageError> {
        if self.fail_list_scopes.load(Ordering::SeqCst) {
            return Err(StorageError::BackendError("scan refused".to_string()));
        }
        self.inner.list_scopes(counter_id)
    }

    fn load_decay_cursor(&self, scope: &ScopeKey) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.pause();
        self.inner.load_decay_cursor(scope)
    }

    fn save_decay_cursor(&self, scope: &ScopeKey, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.inner.save_decay_cursor(scope, at)
    }
}

//! Abstract persistence contract for counters.
//!
//! The engine owns all counter semantics; a backend only has to hand out stable
//! ids, remember values and decay cursors, and soft-delete rows that are no
//! longer configured. Implementations must be safe for concurrent use.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::condition::Condition;
use crate::counter::{CounterId, ScopeKey, TriggerId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Counter not found.
    #[error("Counter not found: {0}")]
    CounterNotFound(CounterId),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// Persistence collaborator for counters, triggers, values and decay cursors.
///
/// # Safety Considerations
/// - `find_or_create_counter` and `init_trigger` must be idempotent and return
///   the same id for the same identity across process restarts.
/// - Deletion is advisory: `mark_unused_*` flags rows, it never drops them.
pub trait CounterStore: Send + Sync {
    /// Find the counter row for this identity or create it.
    ///
    /// Finding a row that was marked for deletion clears the mark.
    fn find_or_create_counter(
        &self,
        name: &str,
        per_channel: bool,
        per_user: bool,
    ) -> Result<CounterId, StorageError>;

    /// Find or create the trigger row, storing its current conditions.
    fn init_trigger(
        &self,
        counter_id: CounterId,
        name: &str,
        condition: Condition,
        reverse_condition: Condition,
    ) -> Result<TriggerId, StorageError>;

    /// Mark every counter not in `active` as to be deleted.
    fn mark_unused_counters_to_be_deleted(&self, active: &[CounterId]) -> Result<(), StorageError>;

    /// Mark every trigger not in `active` as to be deleted.
    fn mark_unused_triggers_to_be_deleted(&self, active: &[TriggerId]) -> Result<(), StorageError>;

    /// Stored value of a scope, `None` if it was never written.
    fn get_value(&self, scope: &ScopeKey) -> Result<Option<i64>, StorageError>;

    /// Persist the value of a scope.
    fn set_value(&self, scope: &ScopeKey, value: i64) -> Result<(), StorageError>;

    /// Every scope of a counter that has a stored value.
    fn list_scopes(&self, counter_id: CounterId) -> Result<Vec<ScopeKey>, StorageError>;

    /// Last instant decay was applied to a scope.
    fn load_decay_cursor(&self, scope: &ScopeKey) -> Result<Option<DateTime<Utc>>, StorageError>;

    /// Persist the decay cursor of a scope.
    fn save_decay_cursor(&self, scope: &ScopeKey, at: DateTime<Utc>) -> Result<(), StorageError>;
}

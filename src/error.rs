//! Error types for kyrocount.
//!
//! All errors are strongly typed using thiserror. Configuration problems are
//! reported as [`ValidationError`]s before anything is mutated; runtime problems
//! reported to callers are [`ExecutionError`]s.

use thiserror::Error;

use crate::counter::CounterId;
use crate::storage::StorageError;

/// Validation errors raised while loading a configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid condition '{input}': {reason}")]
    InvalidCondition {
        input: String,
        reason: String,
    },

    #[error("Limit exceeded: {what} (max: {max}, actual: {actual})")]
    LimitExceeded {
        what: String,
        max: usize,
        actual: usize,
    },

    #[error("Invalid duration '{input}': {reason}")]
    InvalidDuration {
        input: String,
        reason: String,
    },

    #[error("Invalid decay for counter '{counter}': {reason}")]
    InvalidDecay {
        counter: String,
        reason: String,
    },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName {
        name: String,
        reason: String,
    },

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
    },
}

/// Execution errors surfaced to the caller of an engine operation.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Unknown counter: {name}")]
    UnknownCounter {
        name: String,
    },

    #[error("Unknown counter id: {id}")]
    UnknownCounterId {
        id: CounterId,
    },

    #[error("Unknown trigger '{trigger}' on counter '{counter}'")]
    UnknownTrigger {
        counter: String,
        trigger: String,
    },

    #[error("Scope mismatch for counter '{counter}': {reason}")]
    ScopeMismatch {
        counter: String,
        reason: String,
    },

    #[error("Trigger slots exhausted for counter {counter_id} (max: {max})")]
    TriggerSlotsExhausted {
        counter_id: CounterId,
        max: usize,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Engine has been stopped")]
    EngineStopped,

    #[error("Invalid lifecycle transition: {reason}")]
    InvalidLifecycle {
        reason: String,
    },
}

impl From<StorageError> for ExecutionError {
    fn from(err: StorageError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

/// Top-level error type for kyrocount.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl From<StorageError> for CounterError {
    fn from(err: StorageError) -> Self {
        Self::Execution(err.into())
    }
}

impl CounterError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if this error is retryable.
    ///
    /// Only persistence failures may succeed on retry; the engine itself never
    /// retries, the caller decides.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Storage { .. }))
    }
}

/// Result type alias for kyrocount operations.
pub type CounterResult<T> = Result<T, CounterError>;

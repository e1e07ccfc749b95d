//! Trigger notification types.
//!
//! Events are serializable so hosts can forward them to other processes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::counter::{CounterId, ScopeKey, TriggerId};

/// Unique identifier for a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new random subscription id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A trigger's condition became satisfied for a scope (rising edge).
#[allow(missing_docs)]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerFired {
    pub event_id: Uuid,
    pub counter_id: CounterId,
    pub counter: String,
    pub trigger_id: TriggerId,
    pub trigger: String,
    pub scope: ScopeKey,
    pub old_value: i64,
    pub new_value: i64,
    pub timestamp: DateTime<Utc>,
}

impl TriggerFired {
    /// Build an event stamped with a fresh id.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        counter_id: CounterId,
        counter: impl Into<String>,
        trigger_id: TriggerId,
        trigger: impl Into<String>,
        scope: ScopeKey,
        old_value: i64,
        new_value: i64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            counter_id,
            counter: counter.into(),
            trigger_id,
            trigger: trigger.into(),
            scope,
            old_value,
            new_value,
            timestamp,
        }
    }
}

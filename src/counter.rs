//! Counter and trigger definitions, identifiers and scope keys.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// Stable numeric handle of a counter, issued by the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterId(i64);

impl CounterId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable numeric handle of a trigger, issued by the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(i64);

impl TriggerId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// The raw id.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user a per-user counter is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a channel a per-channel counter is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Key of a single value slot: a counter plus the user and/or channel it is
/// isolated to.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub counter_id: CounterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

impl ScopeKey {
    /// Build a scope key.
    #[must_use]
    pub const fn new(counter_id: CounterId, user_id: Option<UserId>, channel_id: Option<ChannelId>) -> Self {
        Self {
            counter_id,
            user_id,
            channel_id,
        }
    }

    /// The single scope of a counter with neither per-user nor per-channel set.
    #[must_use]
    pub const fn global(counter_id: CounterId) -> Self {
        Self::new(counter_id, None, None)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counter={}", self.counter_id)?;
        if let Some(user) = &self.user_id {
            write!(f, " user={user}")?;
        }
        if let Some(channel) = &self.channel_id {
            write!(f, " channel={channel}")?;
        }
        Ok(())
    }
}

/// Automatic decay: every `every`, move the value `amount` toward zero.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecaySpec {
    pub every: Duration,
    pub amount: i64,
}

impl DecaySpec {
    /// Period length in whole milliseconds (at least 1).
    #[must_use]
    pub fn every_ms(&self) -> i64 {
        i64::try_from(self.every.as_millis()).unwrap_or(i64::MAX).max(1)
    }
}

/// A configured counter, bound to its persistence id.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterDefinition {
    pub id: CounterId,
    pub name: String,
    pub pretty_name: Option<String>,
    pub per_user: bool,
    pub per_channel: bool,
    pub initial_value: i64,
    pub decay: Option<DecaySpec>,
}

impl CounterDefinition {
    /// Display name, falling back to the configured name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.pretty_name.as_deref().unwrap_or(&self.name)
    }
}

/// A configured trigger, bound to its persistence id.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDefinition {
    pub id: TriggerId,
    pub name: String,
    pub pretty_name: Option<String>,
    pub condition: Condition,
    pub reverse_condition: Condition,
}

impl TriggerDefinition {
    /// Display name, falling back to the configured name.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.pretty_name.as_deref().unwrap_or(&self.name)
    }

    /// True if `other` has the same firing and clearing conditions.
    #[must_use]
    pub fn same_conditions(&self, other: &Self) -> bool {
        self.condition == other.condition && self.reverse_condition == other.reverse_condition
    }
}

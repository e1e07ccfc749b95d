//! Time sources and duration strings.
//!
//! The engine reads "now" through a [`Clock`] so decay catch-up can be driven
//! deterministically. Durations in configuration are written as one or more
//! `<integer><unit>` segments (`10m`, `1h30m`, `500ms`); a bare integer is a
//! number of minutes.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serializer};

use crate::error::ValidationError;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// use kyrocount::time::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(chrono::Utc::now());
/// let t0 = clock.now();
/// clock.advance(Duration::from_secs(60));
/// assert_eq!((clock.now() - t0).num_seconds(), 60);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = guard.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Parses a duration string such as `10m`, `1h30m`, `2d`, `250ms` or `15`.
///
/// # Errors
///
/// Returns `ValidationError::InvalidDuration` for empty input, unknown units,
/// overflow, or a zero total.
pub fn parse_duration(input: &str) -> Result<Duration, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let text = input.trim();
    if text.is_empty() {
        return Err(invalid("duration is empty"));
    }

    if text.bytes().all(|b| b.is_ascii_digit()) {
        let minutes: u64 = text.parse().map_err(|_| invalid("number is out of range"))?;
        let total = minutes
            .checked_mul(60_000)
            .ok_or_else(|| invalid("duration is out of range"))?;
        return nonzero(Duration::from_millis(total)).ok_or_else(|| invalid("duration must be greater than zero"));
    }

    let mut total_ms: u64 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(invalid("expected a number before each unit"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| invalid("number is out of range"))?;
        rest = &rest[digits..];

        let unit_len = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let unit_ms: u64 = match &rest[..unit_len] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit (expected ms, s, m, h or d)")),
        };
        rest = rest[unit_len..].trim_start();

        total_ms = amount
            .checked_mul(unit_ms)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| invalid("duration is out of range"))?;
    }

    nonzero(Duration::from_millis(total_ms)).ok_or_else(|| invalid("duration must be greater than zero"))
}

fn nonzero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

/// Formats a duration in the compact form accepted by [`parse_duration`].
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let mut ms = u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 {
        return "0ms".to_string();
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86_400_000u64), ("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)] {
        if ms >= size {
            out.push_str(&format!("{}{unit}", ms / size));
            ms %= size;
        }
    }
    out
}

/// Serde adapter for `Duration` fields written as duration strings.
pub mod serde_duration {
    use super::{format_duration, parse_duration, Deserialize, Deserializer, Duration, Serializer};

    /// Serialize as a compact duration string.
    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    /// Deserialize from a duration string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

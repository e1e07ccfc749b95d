//! Configuration model.
//!
//! A [`CountersConfig`] is the document a host hands to the engine, usually
//! deserialized from TOML or JSON:
//!
//! ```toml
//! [counters.spam]
//! per_user = true
//! initial_value = 0
//! decay = { every = "10m", amount = 5 }
//!
//! [counters.spam.triggers.high]
//! condition = ">100"
//! reverse_condition = "<=50"
//! ```
//!
//! [`CountersConfig::validate`] resolves the whole document before the engine
//! touches any state, so a bad document never leaves a half-applied config.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::counter::DecaySpec;
use crate::error::ValidationError;
use crate::time::{parse_duration, serde_duration};

/// Maximum number of counters in one configuration.
pub const MAX_COUNTERS: usize = 50;

/// Maximum number of triggers on one counter.
pub const MAX_TRIGGERS_PER_COUNTER: usize = 20;

/// Maximum length of a counter or trigger name.
pub const MAX_NAME_LENGTH: usize = 64;

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CountersConfig {
    /// Counters keyed by name.
    #[serde(default)]
    pub counters: BTreeMap<String, CounterConfig>,
}

/// One counter as written in configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CounterConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty_name: Option<String>,
    #[serde(default)]
    pub per_user: bool,
    #[serde(default)]
    pub per_channel: bool,
    #[serde(default)]
    pub initial_value: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decay: Option<DecayConfig>,
    #[serde(default)]
    pub triggers: BTreeMap<String, TriggerConfig>,
}

/// Decay as written in configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecayConfig {
    /// Period, as a duration string (`10m`, `1h30m`, bare minutes).
    pub every: String,
    pub amount: i64,
}

/// One trigger as written in configuration.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    pub condition: String,
    /// Clearing condition. Defaults to the reverse of `condition`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty_name: Option<String>,
}

/// A fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    /// Counters in name order.
    pub counters: Vec<ValidatedCounter>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCounter {
    pub name: String,
    pub pretty_name: Option<String>,
    pub per_user: bool,
    pub per_channel: bool,
    pub initial_value: i64,
    pub decay: Option<DecaySpec>,
    pub triggers: Vec<ValidatedTrigger>,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTrigger {
    pub name: String,
    pub pretty_name: Option<String>,
    pub condition: Condition,
    pub reverse_condition: Condition,
}

impl CountersConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ValidationError> {
        toml::from_str(input).map_err(|e| ValidationError::Config {
            message: format!("invalid TOML: {e}"),
        })
    }

    /// Parse a JSON document.
    pub fn from_json_str(input: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(input).map_err(|e| ValidationError::Config {
            message: format!("invalid JSON: {e}"),
        })
    }

    /// Load a `.toml` or `.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ValidationError::Config {
            message: format!("failed to read {}: {e}", path.display()),
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&raw),
            Some("json") => Self::from_json_str(&raw),
            other => Err(ValidationError::Config {
                message: format!("unsupported config extension {other:?} (expected toml or json)"),
            }),
        }
    }

    /// Resolve and check the whole document.
    ///
    /// # Errors
    ///
    /// - `LimitExceeded` for more than [`MAX_COUNTERS`] counters or more than
    ///   [`MAX_TRIGGERS_PER_COUNTER`] triggers on a counter
    /// - `InvalidName`, `InvalidCondition`, `InvalidDuration`, `InvalidDecay`
    pub fn validate(&self) -> Result<ValidatedConfig, ValidationError> {
        if self.counters.len() > MAX_COUNTERS {
            return Err(ValidationError::LimitExceeded {
                what: "counters".to_string(),
                max: MAX_COUNTERS,
                actual: self.counters.len(),
            });
        }

        let mut counters = Vec::with_capacity(self.counters.len());
        for (name, counter) in &self.counters {
            counters.push(counter.validate(name)?);
        }

        Ok(ValidatedConfig { counters })
    }
}

impl CounterConfig {
    fn validate(&self, name: &str) -> Result<ValidatedCounter, ValidationError> {
        validate_name(name)?;

        if self.triggers.len() > MAX_TRIGGERS_PER_COUNTER {
            return Err(ValidationError::LimitExceeded {
                what: format!("triggers on counter '{name}'"),
                max: MAX_TRIGGERS_PER_COUNTER,
                actual: self.triggers.len(),
            });
        }

        let decay = self
            .decay
            .as_ref()
            .map(|d| d.validate(name))
            .transpose()?;

        let mut triggers = Vec::with_capacity(self.triggers.len());
        for (trigger_name, trigger) in &self.triggers {
            validate_name(trigger_name)?;
            let condition = Condition::parse(&trigger.condition)?;
            let reverse_condition = match trigger.reverse_condition.as_deref() {
                Some(raw) => Condition::parse(raw)?,
                None => condition.reverse(),
            };
            triggers.push(ValidatedTrigger {
                name: trigger_name.clone(),
                pretty_name: trigger.pretty_name.clone(),
                condition,
                reverse_condition,
            });
        }

        Ok(ValidatedCounter {
            name: name.to_string(),
            pretty_name: self.pretty_name.clone(),
            per_user: self.per_user,
            per_channel: self.per_channel,
            initial_value: self.initial_value,
            decay,
            triggers,
        })
    }
}

impl DecayConfig {
    fn validate(&self, counter: &str) -> Result<DecaySpec, ValidationError> {
        let every = parse_duration(&self.every)?;
        if self.amount == 0 {
            return Err(ValidationError::InvalidDecay {
                counter: counter.to_string(),
                reason: "amount must be non-zero".to_string(),
            });
        }
        if self.amount == i64::MIN {
            return Err(ValidationError::InvalidDecay {
                counter: counter.to_string(),
                reason: "amount is out of range".to_string(),
            });
        }
        Ok(DecaySpec {
            every,
            amount: self.amount,
        })
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(invalid(&format!("name exceeds {MAX_NAME_LENGTH} characters")));
    }
    Ok(())
}

/// Engine runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// How often the decay worker scans cursors. Independent of any counter's
    /// own decay period; only affects how late decay is applied.
    #[serde(with = "serde_duration")]
    pub decay_apply_interval: Duration,
    /// Buffer capacity of each trigger stream subscription.
    pub stream_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            decay_apply_interval: Duration::from_secs(5 * 60),
            stream_capacity: 1024,
        }
    }
}

impl EngineSettings {
    /// Check settings built in code rather than deserialized.
    ///
    /// # Errors
    ///
    /// `Config` if the decay apply interval is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.decay_apply_interval.is_zero() {
            return Err(ValidationError::Config {
                message: "decay_apply_interval must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::condition::Comparison;

    const SAMPLE: &str = r#"
[counters.spam]
pretty_name = "Spam score"
per_user = true
decay = { every = "10m", amount = 5 }

[counters.spam.triggers.high]
condition = ">100"

[counters.spam.triggers.sticky]
condition = ">= 50"
reverse_condition = "<10"
pretty_name = "Sticky"

[counters.messages]
per_channel = true
initial_value = 3
"#;

    #[test]
    fn parses_and_validates_toml() {
        let cfg = CountersConfig::from_toml_str(SAMPLE).unwrap();
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.counters.len(), 2);

        let messages = &validated.counters[0];
        assert_eq!(messages.name, "messages");
        assert!(messages.per_channel && !messages.per_user);
        assert_eq!(messages.initial_value, 3);
        assert!(messages.decay.is_none());

        let spam = &validated.counters[1];
        assert_eq!(spam.pretty_name.as_deref(), Some("Spam score"));
        assert_eq!(
            spam.decay,
            Some(DecaySpec {
                every: Duration::from_secs(600),
                amount: 5
            })
        );

        let high = &spam.triggers[0];
        assert_eq!(high.condition, Condition::new(Comparison::Gt, 100));
        assert_eq!(high.reverse_condition, Condition::new(Comparison::Le, 100));

        let sticky = &spam.triggers[1];
        assert_eq!(sticky.reverse_condition, Condition::new(Comparison::Lt, 10));
    }

    #[test]
    fn parses_json() {
        let cfg = CountersConfig::from_json_str(
            r#"{"counters": {"c": {"triggers": {"t": {"condition": "=1"}}}}}"#,
        )
        .unwrap();
        let validated = cfg.validate().unwrap();
        assert_eq!(validated.counters[0].triggers[0].reverse_condition.to_string(), "!=1");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = CountersConfig::from_toml_str("[counters.c]\nper_guild = true\n").unwrap_err();
        assert!(matches!(err, ValidationError::Config { .. }));
    }

    #[test]
    fn rejects_too_many_counters() {
        let mut cfg = CountersConfig::default();
        for i in 0..=MAX_COUNTERS {
            cfg.counters.insert(format!("c{i}"), CounterConfig::default());
        }
        let err = cfg.validate().unwrap_err();
        assert_eq!(
            err,
            ValidationError::LimitExceeded {
                what: "counters".to_string(),
                max: MAX_COUNTERS,
                actual: MAX_COUNTERS + 1,
            }
        );
    }

    #[test]
    fn rejects_too_many_triggers() {
        let mut counter = CounterConfig::default();
        for i in 0..=MAX_TRIGGERS_PER_COUNTER {
            counter.triggers.insert(
                format!("t{i}"),
                TriggerConfig {
                    condition: format!(">{i}"),
                    reverse_condition: None,
                    pretty_name: None,
                },
            );
        }
        let mut cfg = CountersConfig::default();
        cfg.counters.insert("c".to_string(), counter);
        assert!(matches!(cfg.validate(), Err(ValidationError::LimitExceeded { .. })));
    }

    #[test]
    fn rejects_invalid_parts() {
        let bad_condition = CountersConfig::from_toml_str(
            "[counters.c.triggers.t]\ncondition = \"about 5\"\n",
        )
        .unwrap();
        assert!(matches!(
            bad_condition.validate(),
            Err(ValidationError::InvalidCondition { .. })
        ));

        let bad_duration =
            CountersConfig::from_toml_str("[counters.c]\ndecay = { every = \"soon\", amount = 1 }\n").unwrap();
        assert!(matches!(
            bad_duration.validate(),
            Err(ValidationError::InvalidDuration { .. })
        ));

        let zero_amount =
            CountersConfig::from_toml_str("[counters.c]\ndecay = { every = \"1m\", amount = 0 }\n").unwrap();
        assert!(matches!(zero_amount.validate(), Err(ValidationError::InvalidDecay { .. })));

        let mut empty_name = CountersConfig::default();
        empty_name.counters.insert("  ".to_string(), CounterConfig::default());
        assert!(matches!(empty_name.validate(), Err(ValidationError::InvalidName { .. })));
    }

    #[test]
    fn loads_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = CountersConfig::from_path(&path).unwrap();
        assert_eq!(cfg.counters.len(), 2);

        let yaml = dir.path().join("counters.yaml");
        std::fs::write(&yaml, "").unwrap();
        assert!(matches!(
            CountersConfig::from_path(&yaml),
            Err(ValidationError::Config { .. })
        ));
    }

    #[test]
    fn engine_settings_defaults_and_overrides() {
        let defaults = EngineSettings::default();
        assert_eq!(defaults.decay_apply_interval, Duration::from_secs(300));

        let settings: EngineSettings =
            serde_json::from_str(r#"{"decay_apply_interval": "2m30s"}"#).unwrap();
        assert_eq!(settings.decay_apply_interval, Duration::from_secs(150));
        assert_eq!(settings.stream_capacity, defaults.stream_capacity);
    }

    #[test]
    fn engine_settings_reject_zero_interval() {
        assert!(EngineSettings::default().validate().is_ok());
        let settings = EngineSettings {
            decay_apply_interval: Duration::ZERO,
            ..EngineSettings::default()
        };
        assert!(matches!(settings.validate(), Err(ValidationError::Config { .. })));
    }
}

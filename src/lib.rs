//! # kyrocount - Scoped counters with edge-triggered thresholds
//!
//! kyrocount keeps integer counters isolated per user and/or channel, fires a
//! notification when a counter crosses a threshold, and decays values back
//! toward zero over time. It is meant to be embedded in a moderation or
//! automation host that owns one engine per guild, tenant or workspace.
//!
//! ## Core Concepts
//!
//! - **Counter**: a named integer, optionally per-user and/or per-channel
//! - **Scope**: one (counter, user?, channel?) slot holding a value
//! - **Trigger**: a threshold condition with a reverse (clearing) condition;
//!   fires once on the rising edge and re-arms only after clearing
//! - **Decay**: periodic movement of a value toward zero, applied with catch-up
//!   so late ticks lose nothing
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kyrocount::{CounterEngine, CountersConfig, EngineSettings, InMemoryCounterStore, UserId};
//!
//! let config = CountersConfig::from_toml_str(r#"
//!     [counters.spam]
//!     per_user = true
//!     decay = { every = "10m", amount = 5 }
//!
//!     [counters.spam.triggers.high]
//!     condition = ">100"
//! "#)?;
//!
//! let engine = CounterEngine::new(Arc::new(InMemoryCounterStore::new()), EngineSettings::default());
//! engine.configure(&config)?;
//! engine.on_trigger_fired(|event: &kyrocount::TriggerFired| -> Result<(), kyrocount::HandlerError> {
//!     println!("{} crossed {} at {}", event.scope, event.trigger, event.new_value);
//!     Ok(())
//! });
//! engine.start()?;
//!
//! let user = UserId::new("42");
//! engine.change_counter_value("spam", Some(&user), None, 30)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod condition;
pub mod counter;
pub mod error;
pub mod time;

// Configuration and persistence
pub mod config;
pub mod storage;

// Evaluation pipeline
pub mod decay;
pub mod notify;
pub mod store;
pub mod trigger;

// Facade
pub mod engine;

pub use condition::{Comparison, Condition};
pub use config::{CounterConfig, CountersConfig, DecayConfig, EngineSettings, TriggerConfig, ValidatedConfig};
pub use counter::{
    ChannelId, CounterDefinition, CounterId, DecaySpec, ScopeKey, TriggerDefinition, TriggerId, UserId,
};
pub use decay::DecayReport;
pub use engine::{ConfigureReport, CounterEngine, CounterInfo};
pub use error::{CounterError, CounterResult, ExecutionError, ValidationError};
pub use notify::{HandlerError, SubscriptionId, TriggerFired, TriggerHandler, TriggerStream};
pub use storage::{CounterStore, InMemoryCounterStore, StorageError};
pub use store::ValueChange;
pub use time::{Clock, ManualClock, SystemClock};

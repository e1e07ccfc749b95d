//! The counter engine.
//!
//! [`CounterEngine`] is the single entry point a host talks to. It owns the
//! value store, trigger evaluator, notification bus and decay scheduler for one
//! owning scope (a guild, a tenant, a workspace) and wires them together:
//! every value change is persisted, then evaluated against the counter's
//! triggers, then published, all while the scope is held.
//!
//! Lifecycle: `new` → `configure` (any number of times) → `start` → `stop`.
//! Value operations work before `start`; only the background decay tick needs
//! it. After `stop` every operation fails with `EngineStopped`.

mod worker;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{CountersConfig, EngineSettings};
use crate::counter::{ChannelId, CounterDefinition, CounterId, ScopeKey, TriggerDefinition, TriggerId, UserId};
use crate::decay::{DecayCursors, DecayReport, DecayScheduler};
use crate::error::{CounterError, CounterResult, ExecutionError};
use crate::notify::{NotificationBus, SubscriptionId, TriggerHandler, TriggerStream};
use crate::storage::CounterStore;
use crate::store::{ValueChange, ValueObserver, ValueStore};
use crate::time::{Clock, SystemClock};
use crate::trigger::{Registration, TriggerEvaluator};

use worker::DecayWorker;

/// A counter together with its triggers, as returned by
/// [`CounterEngine::list_counters`].
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterInfo {
    pub definition: CounterDefinition,
    pub triggers: Vec<TriggerDefinition>,
}

/// Summary of a [`CounterEngine::configure`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigureReport {
    /// Counters active after the call.
    pub counters: usize,
    /// Triggers active after the call.
    pub triggers: usize,
    /// Counters that were not active before.
    pub added_counters: usize,
    /// Counters dropped from the configuration.
    pub removed_counters: usize,
    /// Triggers that were not registered before.
    pub added_triggers: usize,
    /// Triggers dropped from the configuration.
    pub removed_triggers: usize,
    /// Triggers whose conditions changed; their state was reset.
    pub reset_triggers: usize,
}

enum Lifecycle {
    Idle,
    Running(DecayWorker),
    Stopped,
}

/// Evaluates triggers and anchors decay cursors after each value change.
struct ChangeObserver {
    evaluator: Arc<TriggerEvaluator>,
    cursors: Arc<DecayCursors>,
    clock: Arc<dyn Clock>,
}

impl ValueObserver for ChangeObserver {
    fn on_value_changed(&self, counter: &CounterDefinition, scope: &ScopeKey, change: ValueChange) -> CounterResult<()> {
        if counter.decay.is_some() {
            if let Err(err) = self.cursors.track(scope, self.clock.now()) {
                tracing::warn!(counter = %counter.name, scope = %scope, error = %err, "failed to anchor decay cursor");
            }
        }
        self.evaluator.on_value_changed(counter, scope, change)
    }
}

fn poisoned(context: &str) -> CounterError {
    CounterError::internal(format!("engine {context} lock poisoned"))
}

/// Scoped counters with threshold triggers and decay.
pub struct CounterEngine {
    settings: EngineSettings,
    backend: Arc<dyn CounterStore>,
    bus: Arc<NotificationBus>,
    evaluator: Arc<TriggerEvaluator>,
    values: Arc<ValueStore>,
    decay: Arc<DecayScheduler>,
    registry: RwLock<BTreeMap<String, CounterId>>,
    configuring: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for CounterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterEngine")
            .field("settings", &self.settings)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl CounterEngine {
    /// Create an engine backed by `store`, using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn CounterStore>, settings: EngineSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    /// Create an engine with an explicit clock.
    #[must_use]
    pub fn with_clock(store: Arc<dyn CounterStore>, settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        let bus = Arc::new(NotificationBus::new());
        let evaluator = Arc::new(TriggerEvaluator::new(Arc::clone(&bus), Arc::clone(&clock)));
        let cursors = Arc::new(DecayCursors::new(Arc::clone(&store)));
        let observer = Arc::new(ChangeObserver {
            evaluator: Arc::clone(&evaluator),
            cursors: Arc::clone(&cursors),
            clock: Arc::clone(&clock),
        });
        let values = Arc::new(ValueStore::new(Arc::clone(&store), observer));
        let decay = Arc::new(DecayScheduler::new(Arc::clone(&values), cursors, clock));

        Self {
            settings,
            backend: store,
            bus,
            evaluator,
            values,
            decay,
            registry: RwLock::new(BTreeMap::new()),
            configuring: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            stopped: AtomicBool::new(false),
        }
    }

    /// Runtime settings this engine was built with.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The engine's notification bus.
    #[must_use]
    pub fn notification_bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// True once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> CounterResult<()> {
        if self.is_stopped() {
            return Err(ExecutionError::EngineStopped.into());
        }
        Ok(())
    }

    /// Apply a configuration document. May be called again at any time to
    /// hot-reload.
    ///
    /// The whole document is validated before anything is touched. Persistent
    /// ids are then resolved through the store, unused counters and triggers
    /// are marked for deletion, and finally the in-memory state is swapped.
    /// Triggers whose conditions changed start over as not triggered.
    pub fn configure(&self, config: &CountersConfig) -> CounterResult<ConfigureReport> {
        let validated = config.validate()?;
        self.ensure_open()?;
        let _guard = self.configuring.lock().map_err(|_| poisoned("configure"))?;

        let mut resolved = Vec::with_capacity(validated.counters.len());
        for counter in validated.counters {
            let id = self
                .backend
                .find_or_create_counter(&counter.name, counter.per_channel, counter.per_user)?;
            let mut triggers = Vec::with_capacity(counter.triggers.len());
            for trigger in counter.triggers {
                let trigger_id = self
                    .backend
                    .init_trigger(id, &trigger.name, trigger.condition, trigger.reverse_condition)?;
                triggers.push(TriggerDefinition {
                    id: trigger_id,
                    name: trigger.name,
                    pretty_name: trigger.pretty_name,
                    condition: trigger.condition,
                    reverse_condition: trigger.reverse_condition,
                });
            }
            let definition = CounterDefinition {
                id,
                name: counter.name,
                pretty_name: counter.pretty_name,
                per_user: counter.per_user,
                per_channel: counter.per_channel,
                initial_value: counter.initial_value,
                decay: counter.decay,
            };
            let stored_scopes = self.values.stored_scopes(id)?;
            resolved.push((definition, triggers, stored_scopes));
        }

        let counter_ids: Vec<CounterId> = resolved.iter().map(|(c, _, _)| c.id).collect();
        let trigger_ids: Vec<TriggerId> = resolved
            .iter()
            .flat_map(|(_, triggers, _)| triggers.iter().map(|t| t.id))
            .collect();
        self.backend.mark_unused_counters_to_be_deleted(&counter_ids)?;
        self.backend.mark_unused_triggers_to_be_deleted(&trigger_ids)?;

        // No backend calls past this point. Lookups by name wait for the swap.
        let mut registry = self.registry.write().map_err(|_| poisoned("registry"))?;
        let previous: Vec<CounterId> = registry.values().copied().collect();

        let mut report = ConfigureReport {
            counters: resolved.len(),
            triggers: trigger_ids.len(),
            ..ConfigureReport::default()
        };

        for id in &previous {
            if !counter_ids.contains(id) {
                self.values.unregister_counter(*id)?;
                self.evaluator.unregister_counter(*id)?;
                report.removed_counters += 1;
            }
        }

        let mut next = BTreeMap::new();
        for (definition, triggers, stored_scopes) in resolved {
            let id = definition.id;
            if !previous.contains(&id) {
                report.added_counters += 1;
            }
            next.insert(definition.name.clone(), id);
            self.values.install_counter(definition, stored_scopes)?;

            let keep: HashSet<&str> = triggers.iter().map(|t| t.name.as_str()).collect();
            for existing in self.evaluator.triggers(id)? {
                if !keep.contains(existing.name.as_str()) && self.evaluator.unregister_trigger(id, &existing.name)? {
                    report.removed_triggers += 1;
                }
            }
            for trigger in triggers {
                match self.evaluator.register_trigger(id, trigger)? {
                    Registration::Added => report.added_triggers += 1,
                    Registration::Replaced => report.reset_triggers += 1,
                    Registration::Unchanged | Registration::Updated => {}
                }
            }
        }

        *registry = next;
        drop(registry);

        tracing::info!(
            counters = report.counters,
            triggers = report.triggers,
            added_counters = report.added_counters,
            removed_counters = report.removed_counters,
            reset_triggers = report.reset_triggers,
            "counter configuration applied"
        );
        Ok(report)
    }

    /// Start the background decay worker.
    ///
    /// # Errors
    ///
    /// `InvalidLifecycle` if already started, `EngineStopped` after `stop`,
    /// `Config` if the settings carry a zero decay apply interval.
    pub fn start(&self) -> CounterResult<()> {
        self.settings.validate()?;
        let mut lifecycle = self.lifecycle.lock().map_err(|_| poisoned("lifecycle"))?;
        self.ensure_open()?;
        match *lifecycle {
            Lifecycle::Idle => {
                let worker = DecayWorker::start(Arc::clone(&self.decay), self.settings.decay_apply_interval)?;
                *lifecycle = Lifecycle::Running(worker);
                Ok(())
            }
            Lifecycle::Running(_) => Err(ExecutionError::InvalidLifecycle {
                reason: "engine already started".to_string(),
            }
            .into()),
            Lifecycle::Stopped => Err(ExecutionError::EngineStopped.into()),
        }
    }

    /// Stop the engine: cancel and join the decay worker and clear every
    /// subscription. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.decay.cancel();

        let previous = match self.lifecycle.lock() {
            Ok(mut lifecycle) => std::mem::replace(&mut *lifecycle, Lifecycle::Stopped),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), Lifecycle::Stopped),
        };
        if let Lifecycle::Running(worker) = previous {
            worker.stop();
        }

        self.bus.close();
        tracing::info!("counter engine stopped");
    }

    fn counter_by_name(&self, name: &str) -> CounterResult<Arc<CounterDefinition>> {
        self.ensure_open()?;
        let id = {
            let registry = self.registry.read().map_err(|_| poisoned("registry"))?;
            registry.get(name).copied()
        };
        let Some(id) = id else {
            return Err(ExecutionError::UnknownCounter { name: name.to_string() }.into());
        };
        self.values.counter(id)
    }

    fn trigger_by_name(&self, counter: &CounterDefinition, trigger: &str) -> CounterResult<TriggerDefinition> {
        self.evaluator.trigger(counter.id, trigger)?.ok_or_else(|| {
            ExecutionError::UnknownTrigger {
                counter: counter.name.clone(),
                trigger: trigger.to_string(),
            }
            .into()
        })
    }

    /// True if a counter with this name is configured.
    #[must_use]
    pub fn counter_exists(&self, name: &str) -> bool {
        self.counter_by_name(name).is_ok()
    }

    /// Current value of a scope; the initial value if it was never written.
    pub fn get_counter_value(
        &self,
        name: &str,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
    ) -> CounterResult<i64> {
        let counter = self.counter_by_name(name)?;
        self.values.get_value(counter.id, user_id, channel_id)
    }

    /// Add `delta` (possibly negative) to a scope, saturating at the `i64`
    /// bounds.
    pub fn change_counter_value(
        &self,
        name: &str,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
        delta: i64,
    ) -> CounterResult<ValueChange> {
        let counter = self.counter_by_name(name)?;
        self.values.change_value(counter.id, user_id, channel_id, delta)
    }

    /// Set a scope to an absolute value.
    pub fn set_counter_value(
        &self,
        name: &str,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
        value: i64,
    ) -> CounterResult<ValueChange> {
        let counter = self.counter_by_name(name)?;
        self.values.set_value(counter.id, user_id, channel_id, value)
    }

    /// Set a scope back to the counter's initial value. Triggers are evaluated
    /// like for any other write.
    pub fn reset_counter_value(
        &self,
        name: &str,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
    ) -> CounterResult<ValueChange> {
        let counter = self.counter_by_name(name)?;
        self.values
            .set_value(counter.id, user_id, channel_id, counter.initial_value)
    }

    /// Reset every known scope of a counter. Returns the number of scopes reset.
    pub fn reset_all_counter_values(&self, name: &str) -> CounterResult<usize> {
        let counter = self.counter_by_name(name)?;
        let scopes = self.values.known_scopes(counter.id)?;
        for scope in &scopes {
            self.values.update_scope(scope, |_| counter.initial_value)?;
        }
        tracing::debug!(counter = %counter.name, scopes = scopes.len(), "counter reset");
        Ok(scopes.len())
    }

    /// Every configured counter with its triggers, in name order.
    pub fn list_counters(&self) -> CounterResult<Vec<CounterInfo>> {
        self.ensure_open()?;
        let ids: Vec<CounterId> = {
            let registry = self.registry.read().map_err(|_| poisoned("registry"))?;
            registry.values().copied().collect()
        };
        ids.into_iter()
            .map(|id| -> CounterResult<CounterInfo> {
                Ok(CounterInfo {
                    definition: self.values.counter(id)?.as_ref().clone(),
                    triggers: self.evaluator.triggers(id)?,
                })
            })
            .collect()
    }

    /// Display name of a counter.
    pub fn counter_pretty_name(&self, name: &str) -> CounterResult<String> {
        Ok(self.counter_by_name(name)?.display_name().to_string())
    }

    /// Display name of a trigger.
    pub fn trigger_pretty_name(&self, counter: &str, trigger: &str) -> CounterResult<String> {
        let counter = self.counter_by_name(counter)?;
        Ok(self.trigger_by_name(&counter, trigger)?.display_name().to_string())
    }

    /// Whether a trigger is currently in the triggered state for a scope.
    pub fn is_trigger_active(
        &self,
        counter: &str,
        trigger: &str,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
    ) -> CounterResult<bool> {
        let counter = self.counter_by_name(counter)?;
        let scope = ValueStore::scope_for(&counter, user_id, channel_id)?;
        let trigger = self.trigger_by_name(&counter, trigger)?;
        self.evaluator.is_triggered(counter.id, &trigger.name, &scope)
    }

    /// Subscribe a callback to trigger notifications.
    ///
    /// Handlers run on the thread that changed the value, while that scope is
    /// held; a handler must not synchronously update the scope it was notified
    /// about.
    pub fn on_trigger_fired<H>(&self, handler: H) -> SubscriptionId
    where
        H: TriggerHandler + 'static,
    {
        self.bus.subscribe(Arc::new(handler))
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn off_trigger_fired(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Subscribe a buffered stream of trigger notifications.
    #[must_use]
    pub fn subscribe_stream(&self) -> TriggerStream {
        self.bus.subscribe_stream(self.settings.stream_capacity)
    }

    /// Run one decay scan now, independent of the worker.
    pub fn apply_decay(&self) -> CounterResult<DecayReport> {
        self.ensure_open()?;
        self.decay.run_once()
    }
}

impl Drop for CounterEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Edge-triggered threshold evaluation.
//!
//! Each counter owns a small table of trigger slots and, per scope, a bitset of
//! the slots that are currently triggered. A trigger fires when its condition
//! becomes satisfied while its bit is clear, and re-arms only once its reverse
//! condition is satisfied. Values sitting between the two conditions (the
//! hysteresis band) leave the state untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::counter::{CounterDefinition, CounterId, ScopeKey, TriggerDefinition};
use crate::error::{CounterError, CounterResult, ExecutionError};
use crate::notify::{NotificationBus, TriggerFired};
use crate::store::{ValueChange, ValueObserver};
use crate::time::Clock;

/// Width of the per-scope triggered bitset.
pub const MAX_TRIGGER_SLOTS: usize = u32::BITS as usize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TriggeredBits(u32);

impl TriggeredBits {
    const fn contains(self, slot: usize) -> bool {
        self.0 & (1 << slot) != 0
    }

    fn insert(&mut self, slot: usize) {
        self.0 |= 1 << slot;
    }

    fn remove(&mut self, slot: usize) {
        self.0 &= !(1 << slot);
    }

    const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Default)]
struct CounterTriggers {
    slots: Vec<Option<TriggerDefinition>>,
    triggered: HashMap<ScopeKey, TriggeredBits>,
}

impl CounterTriggers {
    fn slot_of(&self, name: &str) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|t| t.name == name))
    }

    fn clear_slot_state(&mut self, slot: usize) {
        self.triggered.retain(|_, bits| {
            bits.remove(slot);
            !bits.is_empty()
        });
    }
}

/// What [`TriggerEvaluator::register_trigger`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A new trigger was added.
    Added,
    /// Same trigger with the same conditions; nothing changed.
    Unchanged,
    /// Same conditions, new id or pretty name; state kept.
    Updated,
    /// Conditions changed; the trigger's state was reset for every scope.
    Replaced,
}

/// Holds trigger definitions and per-scope trigger state.
pub struct TriggerEvaluator {
    counters: RwLock<HashMap<CounterId, Arc<Mutex<CounterTriggers>>>>,
    bus: Arc<NotificationBus>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TriggerEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerEvaluator").finish_non_exhaustive()
    }
}

fn poisoned(context: &str) -> CounterError {
    CounterError::internal(format!("trigger {context} lock poisoned"))
}

impl TriggerEvaluator {
    /// Create an evaluator publishing to `bus`.
    #[must_use]
    pub fn new(bus: Arc<NotificationBus>, clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            bus,
            clock,
        }
    }

    fn entry(&self, counter_id: CounterId) -> CounterResult<Option<Arc<Mutex<CounterTriggers>>>> {
        let counters = self.counters.read().map_err(|_| poisoned("table"))?;
        Ok(counters.get(&counter_id).cloned())
    }

    fn entry_or_create(&self, counter_id: CounterId) -> CounterResult<Arc<Mutex<CounterTriggers>>> {
        if let Some(entry) = self.entry(counter_id)? {
            return Ok(entry);
        }
        let mut counters = self.counters.write().map_err(|_| poisoned("table"))?;
        Ok(Arc::clone(counters.entry(counter_id).or_default()))
    }

    /// Register or update a trigger by name.
    ///
    /// Idempotent per (counter, name). Changing either condition resets the
    /// trigger's state to not-triggered for every scope, since the old state was
    /// computed against conditions that no longer apply.
    pub fn register_trigger(&self, counter_id: CounterId, trigger: TriggerDefinition) -> CounterResult<Registration> {
        let entry = self.entry_or_create(counter_id)?;
        let mut table = entry.lock().map_err(|_| poisoned("counter"))?;

        if let Some(slot) = table.slot_of(&trigger.name) {
            let Some(existing) = table.slots[slot].as_ref() else {
                return Err(CounterError::internal("trigger slot emptied while locked"));
            };
            if existing == &trigger {
                return Ok(Registration::Unchanged);
            }
            let same = existing.same_conditions(&trigger);
            table.slots[slot] = Some(trigger);
            if same {
                return Ok(Registration::Updated);
            }
            table.clear_slot_state(slot);
            return Ok(Registration::Replaced);
        }

        if let Some(free) = table.slots.iter().position(Option::is_none) {
            table.slots[free] = Some(trigger);
        } else if table.slots.len() < MAX_TRIGGER_SLOTS {
            table.slots.push(Some(trigger));
        } else {
            return Err(ExecutionError::TriggerSlotsExhausted {
                counter_id,
                max: MAX_TRIGGER_SLOTS,
            }
            .into());
        }
        Ok(Registration::Added)
    }

    /// Remove a trigger and its state. Returns false if it was not registered.
    pub fn unregister_trigger(&self, counter_id: CounterId, name: &str) -> CounterResult<bool> {
        let Some(entry) = self.entry(counter_id)? else {
            return Ok(false);
        };
        let mut table = entry.lock().map_err(|_| poisoned("counter"))?;
        let Some(slot) = table.slot_of(name) else {
            return Ok(false);
        };
        table.slots[slot] = None;
        table.clear_slot_state(slot);
        Ok(true)
    }

    /// Drop every trigger of a counter.
    pub fn unregister_counter(&self, counter_id: CounterId) -> CounterResult<()> {
        let mut counters = self.counters.write().map_err(|_| poisoned("table"))?;
        counters.remove(&counter_id);
        Ok(())
    }

    /// Registered triggers of a counter, in slot order.
    pub fn triggers(&self, counter_id: CounterId) -> CounterResult<Vec<TriggerDefinition>> {
        let Some(entry) = self.entry(counter_id)? else {
            return Ok(Vec::new());
        };
        let table = entry.lock().map_err(|_| poisoned("counter"))?;
        Ok(table.slots.iter().flatten().cloned().collect())
    }

    /// A registered trigger by name.
    pub fn trigger(&self, counter_id: CounterId, name: &str) -> CounterResult<Option<TriggerDefinition>> {
        let Some(entry) = self.entry(counter_id)? else {
            return Ok(None);
        };
        let table = entry.lock().map_err(|_| poisoned("counter"))?;
        Ok(table.slot_of(name).and_then(|slot| table.slots[slot].clone()))
    }

    /// Whether a trigger is currently triggered for a scope.
    pub fn is_triggered(&self, counter_id: CounterId, name: &str, scope: &ScopeKey) -> CounterResult<bool> {
        let Some(entry) = self.entry(counter_id)? else {
            return Ok(false);
        };
        let table = entry.lock().map_err(|_| poisoned("counter"))?;
        Ok(table
            .slot_of(name)
            .is_some_and(|slot| table.triggered.get(scope).is_some_and(|bits| bits.contains(slot))))
    }

    /// Update trigger state for a value change and return the rising edges.
    ///
    /// Does not publish; see [`ValueObserver::on_value_changed`].
    pub fn evaluate(
        &self,
        counter: &CounterDefinition,
        scope: &ScopeKey,
        change: ValueChange,
    ) -> CounterResult<Vec<TriggerFired>> {
        let Some(entry) = self.entry(counter.id)? else {
            return Ok(Vec::new());
        };
        let mut table = entry.lock().map_err(|_| poisoned("counter"))?;
        let CounterTriggers { slots, triggered } = &mut *table;

        let mut bits = triggered.get(scope).copied().unwrap_or_default();
        let mut fired = Vec::new();

        for (slot, trigger) in slots.iter().enumerate() {
            let Some(trigger) = trigger else { continue };

            let was_triggered = bits.contains(slot);
            if !was_triggered && trigger.condition.is_satisfied_by(change.new) {
                bits.insert(slot);
                fired.push(TriggerFired::new(
                    counter.id,
                    counter.name.clone(),
                    trigger.id,
                    trigger.name.clone(),
                    scope.clone(),
                    change.old,
                    change.new,
                    self.clock.now(),
                ));
            } else if was_triggered && trigger.reverse_condition.is_satisfied_by(change.new) {
                bits.remove(slot);
            }
        }

        if bits.is_empty() {
            triggered.remove(scope);
        } else {
            triggered.insert(scope.clone(), bits);
        }

        Ok(fired)
    }
}

impl ValueObserver for TriggerEvaluator {
    fn on_value_changed(&self, counter: &CounterDefinition, scope: &ScopeKey, change: ValueChange) -> CounterResult<()> {
        let fired = self.evaluate(counter, scope, change)?;
        for event in &fired {
            tracing::debug!(
                counter = %event.counter,
                trigger = %event.trigger,
                scope = %event.scope,
                old_value = event.old_value,
                new_value = event.new_value,
                "trigger fired"
            );
            self.bus.publish(event);
        }
        Ok(())
    }
}

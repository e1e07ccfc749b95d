//! Scoped value store.
//!
//! Owns the current value of every (counter, user?, channel?) scope and writes
//! through to the [`CounterStore`] backend. Each scope has its own mutex, held
//! for the whole read-modify-persist-evaluate sequence, so concurrent updates of
//! one scope are applied in a total order while unrelated scopes never wait on
//! each other. The map of scopes is only locked long enough to find or insert a
//! slot; it is never held across a backend call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::counter::{ChannelId, CounterDefinition, CounterId, ScopeKey, UserId};
use crate::error::{CounterError, CounterResult, ExecutionError};
use crate::storage::CounterStore;

/// Old and new value of a scope after a successful update.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueChange {
    pub old: i64,
    pub new: i64,
}

impl ValueChange {
    /// Signed difference `new - old`, saturating.
    #[must_use]
    pub const fn delta(self) -> i64 {
        self.new.saturating_sub(self.old)
    }
}

/// Callback run after every successful set/change, while the scope is still
/// held. Notifications it produces are therefore ordered with the value
/// changes that caused them.
pub trait ValueObserver: Send + Sync {
    /// Called once per successful update.
    fn on_value_changed(&self, counter: &CounterDefinition, scope: &ScopeKey, change: ValueChange) -> CounterResult<()>;
}

#[derive(Debug, Default)]
struct ScopeSlot {
    /// Cached value; `None` until first read from the backend.
    value: Option<i64>,
    /// The backend holds a value for this scope.
    persisted: bool,
}

/// Scoped value store.
pub struct ValueStore {
    backend: Arc<dyn CounterStore>,
    observer: Arc<dyn ValueObserver>,
    counters: RwLock<HashMap<CounterId, Arc<CounterDefinition>>>,
    slots: Mutex<HashMap<ScopeKey, Arc<Mutex<ScopeSlot>>>>,
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore").finish_non_exhaustive()
    }
}

fn poisoned(context: &str) -> CounterError {
    CounterError::internal(format!("value store {context} lock poisoned"))
}

fn lock_slot(slot: &Mutex<ScopeSlot>) -> CounterResult<MutexGuard<'_, ScopeSlot>> {
    slot.lock().map_err(|_| poisoned("scope"))
}

impl ValueStore {
    /// Create a store writing through to `backend` and reporting to `observer`.
    #[must_use]
    pub fn new(backend: Arc<dyn CounterStore>, observer: Arc<dyn ValueObserver>) -> Self {
        Self {
            backend,
            observer,
            counters: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotently resolve the persistent id of a counter identity.
    pub fn find_or_create(&self, name: &str, per_channel: bool, per_user: bool) -> CounterResult<CounterId> {
        Ok(self.backend.find_or_create_counter(name, per_channel, per_user)?)
    }

    /// Make a counter known, or replace its definition.
    ///
    /// Scopes the backend already holds values for are re-discovered so decay
    /// and bulk resets reach them after a restart.
    pub fn register_counter(&self, definition: CounterDefinition) -> CounterResult<()> {
        let stored_scopes = self.stored_scopes(definition.id)?;
        self.install_counter(definition, stored_scopes)
    }

    /// Scopes the backend holds values for.
    pub fn stored_scopes(&self, counter_id: CounterId) -> CounterResult<Vec<ScopeKey>> {
        Ok(self.backend.list_scopes(counter_id)?)
    }

    /// Register a counter with scopes already fetched through
    /// [`stored_scopes`](Self::stored_scopes). Touches no backend, so it only
    /// fails on a poisoned lock.
    pub fn install_counter(&self, definition: CounterDefinition, stored_scopes: Vec<ScopeKey>) -> CounterResult<()> {
        {
            let mut slots = self.slots.lock().map_err(|_| poisoned("slots"))?;
            for scope in stored_scopes {
                slots.entry(scope).or_insert_with(|| {
                    Arc::new(Mutex::new(ScopeSlot {
                        value: None,
                        persisted: true,
                    }))
                });
            }
        }

        let mut counters = self.counters.write().map_err(|_| poisoned("counters"))?;
        counters.insert(definition.id, Arc::new(definition));
        Ok(())
    }

    /// Forget a counter and its cached scopes. Stored values are untouched.
    pub fn unregister_counter(&self, counter_id: CounterId) -> CounterResult<()> {
        {
            let mut counters = self.counters.write().map_err(|_| poisoned("counters"))?;
            counters.remove(&counter_id);
        }
        let mut slots = self.slots.lock().map_err(|_| poisoned("slots"))?;
        slots.retain(|scope, _| scope.counter_id != counter_id);
        Ok(())
    }

    /// Definition of a registered counter.
    pub fn counter(&self, counter_id: CounterId) -> CounterResult<Arc<CounterDefinition>> {
        let counters = self.counters.read().map_err(|_| poisoned("counters"))?;
        counters
            .get(&counter_id)
            .cloned()
            .ok_or_else(|| ExecutionError::UnknownCounterId { id: counter_id }.into())
    }

    /// Every registered counter definition.
    pub fn counters(&self) -> CounterResult<Vec<Arc<CounterDefinition>>> {
        let counters = self.counters.read().map_err(|_| poisoned("counters"))?;
        let mut all: Vec<_> = counters.values().cloned().collect();
        all.sort_by_key(|c| c.id);
        Ok(all)
    }

    /// Build the scope key for a counter, checking the scope shape.
    ///
    /// # Errors
    ///
    /// `ScopeMismatch` if a user/channel id is given for a counter that is not
    /// per-user/per-channel, or missing for one that is.
    pub fn scope_for(
        counter: &CounterDefinition,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
    ) -> CounterResult<ScopeKey> {
        let mismatch = |reason: &str| -> CounterError {
            ExecutionError::ScopeMismatch {
                counter: counter.name.clone(),
                reason: reason.to_string(),
            }
            .into()
        };

        match (counter.per_user, user_id.is_some()) {
            (false, true) => return Err(mismatch("counter is not per-user but a user id was given")),
            (true, false) => return Err(mismatch("counter is per-user but no user id was given")),
            _ => {}
        }
        match (counter.per_channel, channel_id.is_some()) {
            (false, true) => return Err(mismatch("counter is not per-channel but a channel id was given")),
            (true, false) => return Err(mismatch("counter is per-channel but no channel id was given")),
            _ => {}
        }

        Ok(ScopeKey::new(counter.id, user_id.cloned(), channel_id.cloned()))
    }

    fn check_scope(counter: &CounterDefinition, scope: &ScopeKey) -> CounterResult<()> {
        Self::scope_for(counter, scope.user_id.as_ref(), scope.channel_id.as_ref()).map(|_| ())
    }

    fn slot(&self, scope: &ScopeKey) -> CounterResult<Arc<Mutex<ScopeSlot>>> {
        let mut slots = self.slots.lock().map_err(|_| poisoned("slots"))?;
        Ok(Arc::clone(slots.entry(scope.clone()).or_default()))
    }

    fn existing_slot(&self, scope: &ScopeKey) -> CounterResult<Option<Arc<Mutex<ScopeSlot>>>> {
        let slots = self.slots.lock().map_err(|_| poisoned("slots"))?;
        Ok(slots.get(scope).cloned())
    }

    fn load(&self, counter: &CounterDefinition, scope: &ScopeKey, slot: &mut ScopeSlot) -> CounterResult<i64> {
        if let Some(value) = slot.value {
            return Ok(value);
        }
        let stored = self.backend.get_value(scope)?;
        slot.persisted |= stored.is_some();
        let value = stored.unwrap_or(counter.initial_value);
        slot.value = Some(value);
        Ok(value)
    }

    /// Current value of a scope; the counter's initial value if never written.
    pub fn get_value(
        &self,
        counter_id: CounterId,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
    ) -> CounterResult<i64> {
        let counter = self.counter(counter_id)?;
        let scope = Self::scope_for(&counter, user_id, channel_id)?;

        // Reads never create slots: only written scopes are "known".
        match self.existing_slot(&scope)? {
            Some(slot) => {
                let mut guard = lock_slot(&slot)?;
                self.load(&counter, &scope, &mut guard)
            }
            None => Ok(self.backend.get_value(&scope)?.unwrap_or(counter.initial_value)),
        }
    }

    /// Absolute set.
    pub fn set_value(
        &self,
        counter_id: CounterId,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
        value: i64,
    ) -> CounterResult<ValueChange> {
        let counter = self.counter(counter_id)?;
        let scope = Self::scope_for(&counter, user_id, channel_id)?;
        self.apply(&counter, &scope, |_| value)
    }

    /// Relative update, saturating at the `i64` bounds.
    pub fn change_value(
        &self,
        counter_id: CounterId,
        user_id: Option<&UserId>,
        channel_id: Option<&ChannelId>,
        delta: i64,
    ) -> CounterResult<ValueChange> {
        let counter = self.counter(counter_id)?;
        let scope = Self::scope_for(&counter, user_id, channel_id)?;
        self.apply(&counter, &scope, |old| old.saturating_add(delta))
    }

    /// Update a known scope with a function of its current value.
    ///
    /// This is the single write path; set, change and decay all go through it.
    pub fn update_scope(&self, scope: &ScopeKey, f: impl FnOnce(i64) -> i64) -> CounterResult<ValueChange> {
        let counter = self.counter(scope.counter_id)?;
        Self::check_scope(&counter, scope)?;
        self.apply(&counter, scope, f)
    }

    fn apply(
        &self,
        counter: &CounterDefinition,
        scope: &ScopeKey,
        f: impl FnOnce(i64) -> i64,
    ) -> CounterResult<ValueChange> {
        let slot = self.slot(scope)?;
        let mut guard = lock_slot(&slot)?;

        let old = self.load(counter, scope, &mut guard)?;
        let new = f(old);
        self.backend.set_value(scope, new)?;
        guard.value = Some(new);
        guard.persisted = true;

        let change = ValueChange { old, new };
        if let Err(err) = self.observer.on_value_changed(counter, scope, change) {
            // The value is committed; only trigger bookkeeping is affected.
            tracing::error!(counter = %counter.name, scope = %scope, error = %err, "trigger evaluation failed");
        }
        Ok(change)
    }

    /// Scopes of a counter that hold a stored value, in key order.
    pub fn known_scopes(&self, counter_id: CounterId) -> CounterResult<Vec<ScopeKey>> {
        let candidates: Vec<(ScopeKey, Arc<Mutex<ScopeSlot>>)> = {
            let slots = self.slots.lock().map_err(|_| poisoned("slots"))?;
            slots
                .iter()
                .filter(|(scope, _)| scope.counter_id == counter_id)
                .map(|(scope, slot)| (scope.clone(), Arc::clone(slot)))
                .collect()
        };

        let mut scopes = Vec::with_capacity(candidates.len());
        for (scope, slot) in candidates {
            if lock_slot(&slot)?.persisted {
                scopes.push(scope);
            }
        }
        scopes.sort();
        Ok(scopes)
    }
}

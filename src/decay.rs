//! Catch-up decay.
//!
//! Every scope of a decaying counter has a cursor: the instant decay was last
//! accounted for. A scan computes how many whole periods elapsed since the
//! cursor, applies all of them in one update, and advances the cursor by
//! exactly that many periods. The fractional remainder carries over, so the
//! total decay applied does not depend on how often scans run.
//!
//! Decay moves a value toward zero by `|amount|` per period and never crosses
//! zero.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::counter::{CounterDefinition, DecaySpec, ScopeKey};
use crate::error::{CounterError, CounterResult};
use crate::storage::CounterStore;
use crate::store::ValueStore;
use crate::time::Clock;

/// Move `value` toward zero by `total`, stopping at zero.
#[must_use]
pub fn decay_toward_zero(value: i64, total: i64) -> i64 {
    let total = total.saturating_abs();
    match value.signum() {
        1 => value.saturating_sub(total).max(0),
        -1 => value.saturating_add(total).min(0),
        _ => 0,
    }
}

/// Whole periods of `spec` elapsed between `since` and `now`.
#[must_use]
pub fn elapsed_periods(spec: &DecaySpec, since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let elapsed_ms = (now - since).num_milliseconds();
    if elapsed_ms <= 0 {
        return 0;
    }
    elapsed_ms / spec.every_ms()
}

fn poisoned() -> CounterError {
    CounterError::internal("decay cursor lock poisoned")
}

/// Decay cursors, cached in memory and persisted through the backend.
pub struct DecayCursors {
    backend: Arc<dyn CounterStore>,
    cursors: Mutex<HashMap<ScopeKey, DateTime<Utc>>>,
}

impl std::fmt::Debug for DecayCursors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecayCursors").finish_non_exhaustive()
    }
}

impl DecayCursors {
    /// Create an empty cursor book.
    #[must_use]
    pub fn new(backend: Arc<dyn CounterStore>) -> Self {
        Self {
            backend,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Cached cursor of a scope.
    pub fn get(&self, scope: &ScopeKey) -> CounterResult<Option<DateTime<Utc>>> {
        let cursors = self.cursors.lock().map_err(|_| poisoned())?;
        Ok(cursors.get(scope).copied())
    }

    /// Return the cursor of a scope, loading it from the backend or anchoring
    /// it at `now` if the scope has never been decayed.
    pub fn track(&self, scope: &ScopeKey, now: DateTime<Utc>) -> CounterResult<DateTime<Utc>> {
        if let Some(at) = self.get(scope)? {
            return Ok(at);
        }

        // Backend calls happen outside the map lock.
        let at = match self.backend.load_decay_cursor(scope)? {
            Some(stored) => stored,
            None => {
                self.backend.save_decay_cursor(scope, now)?;
                now
            }
        };

        let mut cursors = self.cursors.lock().map_err(|_| poisoned())?;
        Ok(*cursors.entry(scope.clone()).or_insert(at))
    }

    fn advance(&self, scope: &ScopeKey, to: DateTime<Utc>) -> CounterResult<()> {
        {
            let mut cursors = self.cursors.lock().map_err(|_| poisoned())?;
            cursors.insert(scope.clone(), to);
        }
        self.backend.save_decay_cursor(scope, to)?;
        Ok(())
    }
}

/// Result of one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayReport {
    /// Scopes whose cursor was examined.
    pub scopes_scanned: usize,
    /// Scopes that had at least one whole period applied.
    pub scopes_decayed: usize,
    /// Sum of periods applied over all scopes.
    pub periods_applied: i64,
    /// Scopes whose update or cursor handling failed; retried next scan.
    pub failures: usize,
    /// The scan stopped early because the scheduler was cancelled.
    pub cancelled: bool,
}

/// Applies decay for every scope of every decaying counter.
pub struct DecayScheduler {
    values: Arc<ValueStore>,
    cursors: Arc<DecayCursors>,
    clock: Arc<dyn Clock>,
    cancelled: AtomicBool,
    /// Held for a whole scan; cursors are read and advanced under it.
    scan: Mutex<()>,
}

impl std::fmt::Debug for DecayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecayScheduler")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DecayScheduler {
    /// Create a scheduler updating `values` through its normal write path.
    #[must_use]
    pub fn new(values: Arc<ValueStore>, cursors: Arc<DecayCursors>, clock: Arc<dyn Clock>) -> Self {
        Self {
            values,
            cursors,
            clock,
            cancelled: AtomicBool::new(false),
            scan: Mutex::new(()),
        }
    }

    /// Stop any scan in progress and all future scans.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The cursor book.
    #[must_use]
    pub fn cursors(&self) -> &DecayCursors {
        &self.cursors
    }

    /// Scan at the clock's current time.
    pub fn run_once(&self) -> CounterResult<DecayReport> {
        self.run_at(self.clock.now())
    }

    /// Scan as of `now`.
    ///
    /// Only counters whose current definition configures decay are scanned;
    /// cursors of counters that lost their decay setting are kept but ignored.
    /// Concurrent scans run one after the other, so a period is never applied
    /// twice.
    pub fn run_at(&self, now: DateTime<Utc>) -> CounterResult<DecayReport> {
        let _scan = self
            .scan
            .lock()
            .map_err(|_| CounterError::internal("decay scan lock poisoned"))?;
        let mut report = DecayReport::default();

        for counter in self.values.counters()? {
            let Some(spec) = counter.decay else { continue };
            for scope in self.values.known_scopes(counter.id)? {
                if self.is_cancelled() {
                    report.cancelled = true;
                    return Ok(report);
                }
                report.scopes_scanned += 1;
                match self.decay_scope(&counter, &spec, &scope, now) {
                    Ok(0) => {}
                    Ok(periods) => {
                        report.scopes_decayed += 1;
                        report.periods_applied += periods;
                    }
                    Err(err) => {
                        report.failures += 1;
                        tracing::warn!(counter = %counter.name, scope = %scope, error = %err, "decay failed");
                    }
                }
            }
        }

        if report.scopes_decayed > 0 || report.failures > 0 {
            tracing::debug!(
                scanned = report.scopes_scanned,
                decayed = report.scopes_decayed,
                periods = report.periods_applied,
                failures = report.failures,
                "decay scan finished"
            );
        }
        Ok(report)
    }

    fn decay_scope(
        &self,
        counter: &CounterDefinition,
        spec: &DecaySpec,
        scope: &ScopeKey,
        now: DateTime<Utc>,
    ) -> CounterResult<i64> {
        let last = self.cursors.track(scope, now)?;
        let periods = elapsed_periods(spec, last, now);
        if periods < 1 {
            return Ok(0);
        }

        let total = periods.saturating_mul(spec.amount.saturating_abs());
        let change = self
            .values
            .update_scope(scope, |value| decay_toward_zero(value, total))?;

        // Only reached once the update is persisted.
        let next = last + Duration::milliseconds(periods * spec.every_ms());
        if let Err(err) = self.cursors.advance(scope, next) {
            tracing::warn!(counter = %counter.name, scope = %scope, error = %err, "failed to persist decay cursor");
        }

        tracing::trace!(
            counter = %counter.name,
            scope = %scope,
            periods,
            old_value = change.old,
            new_value = change.new,
            "decay applied"
        );
        Ok(periods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration as StdDuration;

    use crate::counter::CounterId;
    use crate::storage::InMemoryCounterStore;
    use crate::store::{ValueChange, ValueObserver};
    use crate::time::ManualClock;

    struct Tracker {
        cursors: Arc<DecayCursors>,
        clock: Arc<ManualClock>,
    }

    impl ValueObserver for Tracker {
        fn on_value_changed(&self, counter: &CounterDefinition, scope: &ScopeKey, _: ValueChange) -> CounterResult<()> {
            if counter.decay.is_some() {
                self.cursors.track(scope, self.clock.now())?;
            }
            Ok(())
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        values: Arc<ValueStore>,
        scheduler: DecayScheduler,
        counter: CounterId,
    }

    fn fixture(initial: i64, decay: Option<DecaySpec>) -> Fixture {
        let backend = Arc::new(InMemoryCounterStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cursors = Arc::new(DecayCursors::new(backend.clone()));
        let values = Arc::new(ValueStore::new(
            backend.clone(),
            Arc::new(Tracker {
                cursors: Arc::clone(&cursors),
                clock: Arc::clone(&clock),
            }),
        ));
        let counter = values.find_or_create("c", false, false).unwrap();
        values
            .register_counter(CounterDefinition {
                id: counter,
                name: "c".to_string(),
                pretty_name: None,
                per_user: false,
                per_channel: false,
                initial_value: initial,
                decay,
            })
            .unwrap();
        let scheduler = DecayScheduler::new(Arc::clone(&values), cursors, clock.clone());
        Fixture {
            clock,
            values,
            scheduler,
            counter,
        }
    }

    fn ten_minutes_by_five() -> Option<DecaySpec> {
        Some(DecaySpec {
            every: StdDuration::from_secs(600),
            amount: 5,
        })
    }

    #[test]
    fn toward_zero_clamps_both_directions() {
        assert_eq!(decay_toward_zero(12, 5), 7);
        assert_eq!(decay_toward_zero(3, 5), 0);
        assert_eq!(decay_toward_zero(-12, 5), -7);
        assert_eq!(decay_toward_zero(-3, 5), 0);
        assert_eq!(decay_toward_zero(0, 5), 0);
        assert_eq!(decay_toward_zero(10, -4), 6);
        assert_eq!(decay_toward_zero(i64::MIN, i64::MAX), -1);
    }

    #[test]
    fn catches_up_whole_periods_and_keeps_remainder() {
        let f = fixture(0, ten_minutes_by_five());
        let start = f.clock.now();
        f.values.set_value(f.counter, None, None, 100).unwrap();

        // Ticks every 2.5 minutes up to 40 minutes, then one at 41.
        for _ in 0..16 {
            f.clock.advance(StdDuration::from_secs(150));
            f.scheduler.run_once().unwrap();
        }
        f.clock.advance(StdDuration::from_secs(60));
        f.scheduler.run_once().unwrap();

        assert_eq!(f.values.get_value(f.counter, None, None).unwrap(), 80);
        let cursor = f.scheduler.cursors().get(&ScopeKey::global(f.counter)).unwrap().unwrap();
        assert_eq!(cursor - start, Duration::minutes(40));
        assert_eq!(f.clock.now() - cursor, Duration::minutes(1));
    }

    #[test]
    fn delayed_tick_applies_all_missed_periods_at_once() {
        let f = fixture(0, ten_minutes_by_five());
        f.values.set_value(f.counter, None, None, 100).unwrap();

        f.clock.advance(StdDuration::from_secs(41 * 60));
        let report = f.scheduler.run_once().unwrap();
        assert_eq!(report.periods_applied, 4);
        assert_eq!(report.scopes_decayed, 1);
        assert_eq!(f.values.get_value(f.counter, None, None).unwrap(), 80);

        // Nothing more is due until the next boundary.
        f.clock.advance(StdDuration::from_secs(8 * 60));
        assert_eq!(f.scheduler.run_once().unwrap().periods_applied, 0);
        f.clock.advance(StdDuration::from_secs(60));
        assert_eq!(f.scheduler.run_once().unwrap().periods_applied, 1);
        assert_eq!(f.values.get_value(f.counter, None, None).unwrap(), 75);
    }

    #[test]
    fn negative_values_decay_up_to_zero() {
        let f = fixture(0, ten_minutes_by_five());
        f.values.set_value(f.counter, None, None, -12).unwrap();
        f.clock.advance(StdDuration::from_secs(20 * 60));
        f.scheduler.run_once().unwrap();
        assert_eq!(f.values.get_value(f.counter, None, None).unwrap(), -2);

        f.clock.advance(StdDuration::from_secs(10 * 60));
        f.scheduler.run_once().unwrap();
        assert_eq!(f.values.get_value(f.counter, None, None).unwrap(), 0);
    }

    #[test]
    fn counters_without_decay_and_unwritten_scopes_are_skipped() {
        let f = fixture(50, None);
        f.values.set_value(f.counter, None, None, 50).unwrap();
        f.clock.advance(StdDuration::from_secs(3600));
        let report = f.scheduler.run_once().unwrap();
        assert_eq!(report, DecayReport::default());

        let g = fixture(50, ten_minutes_by_five());
        g.clock.advance(StdDuration::from_secs(3600));
        assert_eq!(g.scheduler.run_once().unwrap().scopes_scanned, 0);
        assert_eq!(g.values.get_value(g.counter, None, None).unwrap(), 50);
    }

    #[test]
    fn cancelled_scheduler_does_nothing() {
        let f = fixture(0, ten_minutes_by_five());
        f.values.set_value(f.counter, None, None, 100).unwrap();
        f.clock.advance(StdDuration::from_secs(3600));
        f.scheduler.cancel();
        let report = f.scheduler.run_once().unwrap();
        assert!(report.cancelled);
        assert_eq!(f.values.get_value(f.counter, None, None).unwrap(), 100);
    }

    #[test]
    fn elapsed_periods_handles_clock_skew() {
        let spec = DecaySpec {
            every: StdDuration::from_secs(60),
            amount: 1,
        };
        let now = Utc::now();
        assert_eq!(elapsed_periods(&spec, now, now - Duration::minutes(5)), 0);
        assert_eq!(elapsed_periods(&spec, now - Duration::seconds(179), now), 2);
    }
}

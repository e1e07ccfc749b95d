mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use kyrocount::{CounterEngine, CounterStore, CountersConfig, EngineSettings, InMemoryCounterStore, ManualClock, UserId};

use common::FlakyStore;

const DECAYING: &str = r#"
[counters.spam]
per_user = true
decay = { every = "10m", amount = 5 }

[counters.spam.triggers.high]
condition = ">100"
"#;

fn engine_with(store: Arc<dyn CounterStore>, clock: Arc<ManualClock>, toml: &str) -> CounterEngine {
    let engine = CounterEngine::with_clock(store, EngineSettings::default(), clock);
    engine
        .configure(&CountersConfig::from_toml_str(toml).unwrap())
        .unwrap();
    engine
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

#[test]
fn frequent_ticks_apply_only_whole_periods() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = engine_with(Arc::new(InMemoryCounterStore::new()), Arc::clone(&clock), DECAYING);
    let user = UserId::new("42");
    engine.set_counter_value("spam", Some(&user), None, 100).unwrap();

    // A tick every 2.5 minutes for 41 minutes.
    let mut elapsed = Duration::ZERO;
    while elapsed + Duration::from_secs(150) <= minutes(41) {
        clock.advance(Duration::from_secs(150));
        elapsed += Duration::from_secs(150);
        engine.apply_decay().unwrap();
    }
    clock.advance(minutes(41) - elapsed);
    engine.apply_decay().unwrap();

    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 80);
}

#[test]
fn decay_clears_trigger_without_firing() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = engine_with(Arc::new(InMemoryCounterStore::new()), Arc::clone(&clock), DECAYING);
    let stream = engine.subscribe_stream();
    let user = UserId::new("42");

    engine.set_counter_value("spam", Some(&user), None, 110).unwrap();
    assert_eq!(stream.drain().len(), 1);

    clock.advance(minutes(20));
    let report = engine.apply_decay().unwrap();
    assert_eq!(report.periods_applied, 2);
    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 100);
    assert!(!engine.is_trigger_active("spam", "high", Some(&user), None).unwrap());
    assert!(stream.drain().is_empty());

    engine.change_counter_value("spam", Some(&user), None, 1).unwrap();
    assert_eq!(stream.drain().len(), 1);
}

#[test]
fn decay_stops_at_zero() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = engine_with(Arc::new(InMemoryCounterStore::new()), Arc::clone(&clock), DECAYING);
    let user = UserId::new("42");
    engine.set_counter_value("spam", Some(&user), None, 7).unwrap();

    clock.advance(minutes(24 * 60));
    engine.apply_decay().unwrap();
    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 0);
}

#[test]
fn failed_write_keeps_periods_for_the_next_scan() {
    let store = Arc::new(FlakyStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = engine_with(store.clone(), Arc::clone(&clock), DECAYING);
    let user = UserId::new("42");
    engine.set_counter_value("spam", Some(&user), None, 100).unwrap();

    store.fail_writes.store(true, Ordering::SeqCst);
    clock.advance(minutes(30));
    let report = engine.apply_decay().unwrap();
    assert_eq!(report.failures, 1);
    assert_eq!(report.periods_applied, 0);
    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 100);

    store.fail_writes.store(false, Ordering::SeqCst);
    clock.advance(minutes(10));
    let report = engine.apply_decay().unwrap();
    assert_eq!(report.periods_applied, 4);
    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 80);
}

#[test]
fn overlapping_scans_apply_each_period_once() {
    let store = Arc::new(FlakyStore::default());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let user = UserId::new("42");
    {
        let first = engine_with(store.clone(), Arc::clone(&clock), DECAYING);
        first.set_counter_value("spam", Some(&user), None, 100).unwrap();
    }

    // Fresh engine: the cursor has to come from the slowed-down store.
    clock.advance(minutes(40));
    let engine = Arc::new(engine_with(store.clone(), Arc::clone(&clock), DECAYING));
    store.delay_ms.store(200, Ordering::SeqCst);

    let scans: Vec<_> = (0..2)
        .map(|i| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(i * 50));
                engine.apply_decay().unwrap().periods_applied
            })
        })
        .collect();
    let total: i64 = scans.into_iter().map(|h| h.join().unwrap()).sum();

    store.delay_ms.store(0, Ordering::SeqCst);
    assert_eq!(total, 4);
    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 80);
}

#[test]
fn cursor_survives_restart() {
    let store = Arc::new(InMemoryCounterStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let user = UserId::new("42");

    {
        let first = engine_with(store.clone(), Arc::clone(&clock), DECAYING);
        first.set_counter_value("spam", Some(&user), None, 100).unwrap();
        clock.advance(minutes(15));
        first.apply_decay().unwrap();
        assert_eq!(first.get_counter_value("spam", Some(&user), None).unwrap(), 95);
    }

    // Down for 25 minutes; 5 minutes of the first period were already accrued.
    clock.advance(minutes(25));
    let second = engine_with(store, Arc::clone(&clock), DECAYING);
    let report = second.apply_decay().unwrap();
    assert_eq!(report.periods_applied, 3);
    assert_eq!(second.get_counter_value("spam", Some(&user), None).unwrap(), 80);
}

#[test]
fn removing_decay_on_reload_stops_it() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let engine = engine_with(Arc::new(InMemoryCounterStore::new()), Arc::clone(&clock), DECAYING);
    let user = UserId::new("42");
    engine.set_counter_value("spam", Some(&user), None, 100).unwrap();

    engine
        .configure(&CountersConfig::from_toml_str("[counters.spam]\nper_user = true\n").unwrap())
        .unwrap();
    clock.advance(minutes(60));
    let report = engine.apply_decay().unwrap();
    assert_eq!(report.scopes_scanned, 0);
    assert_eq!(engine.get_counter_value("spam", Some(&user), None).unwrap(), 100);
}

#[test]
fn background_worker_applies_decay_until_stopped() {
    let engine = CounterEngine::new(
        Arc::new(InMemoryCounterStore::new()),
        EngineSettings {
            decay_apply_interval: Duration::from_millis(10),
            stream_capacity: 16,
        },
    );
    engine
        .configure(
            &CountersConfig::from_toml_str(
                r#"
[counters.burst]
decay = { every = "20ms", amount = 1 }
"#,
            )
            .unwrap(),
        )
        .unwrap();
    engine.set_counter_value("burst", None, None, 3).unwrap();
    engine.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.get_counter_value("burst", None, None).unwrap() != 0 {
        assert!(Instant::now() < deadline, "decay worker made no progress");
        std::thread::sleep(Duration::from_millis(5));
    }

    let started = Instant::now();
    engine.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
}

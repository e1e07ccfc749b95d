use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use kyrocount::{CounterEngine, CountersConfig, EngineSettings, InMemoryCounterStore, UserId};

const CONFIG: &str = r#"
[counters.spam]
per_user = true
decay = { every = "10m", amount = 5 }

[counters.spam.triggers.high]
condition = ">100"
reverse_condition = "<=50"

[counters.spam.triggers.extreme]
condition = ">=1000"
"#;

fn make_engine() -> CounterEngine {
    let engine = CounterEngine::new(Arc::new(InMemoryCounterStore::new()), EngineSettings::default());
    engine
        .configure(&CountersConfig::from_toml_str(CONFIG).expect("bench config"))
        .expect("configure");
    engine
}

fn bench_change_hot_scope(c: &mut Criterion) {
    let engine = make_engine();
    let user = UserId::new("hot");

    let mut group = c.benchmark_group("change_value");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hot_scope", |b| {
        let mut delta = 7;
        b.iter(|| {
            // Oscillate through the hysteresis band so triggers keep firing.
            delta = -delta;
            engine
                .change_counter_value("spam", Some(&user), None, delta * 20)
                .expect("change")
        });
    });
    group.finish();
}

fn bench_change_many_scopes(c: &mut Criterion) {
    let engine = make_engine();
    let users: Vec<UserId> = (0..1024).map(|i| UserId::new(i.to_string())).collect();

    let mut group = c.benchmark_group("change_value");
    group.throughput(Throughput::Elements(users.len() as u64));
    group.bench_function("1024_scopes", |b| {
        b.iter(|| {
            for user in &users {
                engine
                    .change_counter_value("spam", Some(user), None, 1)
                    .expect("change");
            }
        });
    });
    group.finish();
}

fn bench_decay_scan(c: &mut Criterion) {
    let engine = make_engine();
    for i in 0..1024 {
        let user = UserId::new(i.to_string());
        engine
            .set_counter_value("spam", Some(&user), None, 500)
            .expect("seed");
    }

    c.bench_function("decay/scan_1024_scopes_nothing_due", |b| {
        b.iter(|| engine.apply_decay().expect("scan"));
    });
}

criterion_group!(benches, bench_change_hot_scope, bench_change_many_scopes, bench_decay_scan);
criterion_main!(benches);

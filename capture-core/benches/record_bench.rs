//! Benchmarks for the capture hot path
//!
//! Compares an armed engine (trigger check only) with a triggered one
//! (trigger, filter and buffer write), plus the reader's release walk.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use capture_core::kernel::sim::{SimKernel, SimThread};
use capture_core::protocol::{events, name_from_str};
use capture_core::{CaptureConfig, CaptureEngine, ControlKey, Thread, ThreadExtension, TriggerKind, TriggerMode};

fn setup(capacity: usize) -> (Arc<SimKernel>, CaptureEngine<SimKernel>, Arc<SimThread>, Arc<SimThread>) {
    let kernel = Arc::new(SimKernel::new());
    let engine = CaptureEngine::with_config(
        Arc::clone(&kernel),
        CaptureConfig::default().with_capacity(capacity).with_global_watch(true),
    );
    engine.open_default().unwrap();
    let a = kernel.spawn(name_from_str("A").unwrap(), 10);
    let b = kernel.spawn(name_from_str("B").unwrap(), 10);
    (kernel, engine, a, b)
}

fn drain(engine: &CaptureEngine<SimKernel>) {
    let batch = engine.read(0, Duration::ZERO).unwrap();
    let n = batch.len();
    batch.release(n).unwrap();
}

fn bench_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_switch");

    group.bench_function(BenchmarkId::new("armed", "no_rule"), |bench| {
        let (_kernel, engine, a, b) = setup(64 * 1024);
        engine.set_enabled(true).unwrap();
        bench.iter(|| {
            engine.thread_switch(black_box(&a), black_box(&b));
        })
    });

    group.bench_function(BenchmarkId::new("triggered", "record"), |bench| {
        let (_kernel, engine, a, b) = setup(64 * 1024);
        engine
            .set_trigger(ControlKey::default(), ControlKey::by_id(b.id()), TriggerMode::FromAny, TriggerKind::Switch)
            .unwrap();
        engine.set_enabled(true).unwrap();
        let mut n = 0u32;
        bench.iter(|| {
            engine.thread_switch(black_box(&a), black_box(&b));
            n += 1;
            if n % 1000 == 0 {
                drain(&engine);
            }
        })
    });

    group.finish();
}

fn bench_record_event(c: &mut Criterion) {
    let (_kernel, engine, a, b) = setup(64 * 1024);
    engine
        .set_trigger(ControlKey::default(), ControlKey::by_id(b.id()), TriggerMode::FromAny, TriggerKind::Create)
        .unwrap();
    engine.thread_create(&a, &b);

    let payload = [0u8; 16];
    c.bench_function("record_event_16b", |bench| {
        let mut n = 0u32;
        bench.iter(|| {
            engine.record_event(&*a, events::TIMESTAMP, black_box(&payload));
            n += 1;
            if n % 1000 == 0 {
                drain(&engine);
            }
        })
    });
}

fn bench_release(c: &mut Criterion) {
    c.bench_function("release_1000_records", |bench| {
        let (_kernel, engine, a, b) = setup(64 * 1024);
        engine
            .set_trigger(ControlKey::by_id(a.id()), ControlKey::default(), TriggerMode::ToAny, TriggerKind::Create)
            .unwrap();
        engine.thread_create(&a, &b);
        bench.iter(|| {
            engine.flush(false).unwrap();
            for _ in 0..1000 {
                engine.record_event(&*a, events::TIMESTAMP, &[]);
            }
            drain(&engine);
        })
    });
}

criterion_group!(benches, bench_switch, bench_record_event, bench_release);
criterion_main!(benches);

//! Broadcast benchmarks for the avatar mixer
//!
//! Measures ingestion and per-tick broadcast cost at various crowd sizes.
//!
//! Run with: cargo bench --bench broadcast

use std::sync::Arc;

use avatar_mixer::config::MixerConfig;
use avatar_mixer::crowd::SimulatedCrowd;
use avatar_mixer::metrics::Metrics;
use avatar_mixer::mixer::{AvatarMixer, BroadcastScheduler, BroadcastSettings, MixerLoop};
use avatar_mixer::net::transport::LoopbackTransport;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const DT: f32 = 1.0 / 60.0;

fn create_mixer(count: usize) -> (Arc<AvatarMixer>, Arc<LoopbackTransport>, SimulatedCrowd) {
    let transport = Arc::new(LoopbackTransport::with_history_limit(1));
    let mixer = Arc::new(AvatarMixer::new(
        MixerConfig::default(),
        transport.clone(),
        Arc::new(Metrics::new()),
    ));
    let mut crowd = SimulatedCrowd::spawn(&mixer, &transport, count, 42);
    crowd.step(&mixer, &transport, DT);
    (mixer, transport, crowd)
}

/// Benchmark packet ingestion for a whole crowd
fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    group.sample_size(50);

    for count in [50, 200, 500] {
        let (mixer, transport, mut crowd) = create_mixer(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("crowd_step", count), &count, |b, _| {
            b.iter(|| crowd.step(&mixer, &transport, black_box(DT)))
        });
    }
    group.finish();
}

/// Benchmark the broadcast pass alone
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    group.sample_size(30);

    for count in [50, 200, 500] {
        let (mixer, transport, mut crowd) = create_mixer(count);
        let settings = BroadcastSettings::from(mixer.config());
        let mut scheduler = BroadcastScheduler::with_seed(settings, 7);
        let agents = mixer.directory().agents();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("tick", count), &count, |b, _| {
            b.iter(|| {
                // Fresh sequences so every pair has something to send
                crowd.step(&mixer, &transport, DT);
                black_box(scheduler.run_tick(&agents, transport.as_ref()))
            })
        });
    }
    group.finish();
}

/// Benchmark a full mixer tick: events, broadcast, stats and throttle
fn bench_full_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_tick");
    group.sample_size(30);

    for count in [50, 200, 500] {
        let (mixer, transport, mut crowd) = create_mixer(count);
        let mut mixer_loop = MixerLoop::new(mixer.clone());

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("complete", count), &count, |b, _| {
            b.iter(|| {
                crowd.step(&mixer, &transport, DT);
                black_box(mixer_loop.tick())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ingest, bench_broadcast, bench_full_tick);
criterion_main!(benches);

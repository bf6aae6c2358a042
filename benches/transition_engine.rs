//! Benchmarks for transition lookup and the persisted engine
//!
//! Target: 100K committed transitions/sec on the in-memory store

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use storage_lifecycle::domain::volume_transitions;
use storage_lifecycle::{
    LifecycleEngines, LifecycleEntity, LifecycleTables, MemoryDatabase, Owner, Volume, VolumeEvent,
    VolumeState,
};
use std::sync::Arc;

fn engines() -> LifecycleEngines {
    let tables = LifecycleTables::build().expect("tables");
    LifecycleEngines::new(&tables, Arc::new(MemoryDatabase::new()), None)
}

fn ready_volume(engines: &LifecycleEngines, id: &str) -> Volume {
    let volume = Volume::new("bench", Owner::new("acct-1", "dom-1", "zone-1"), 1 << 30).with_id(id);
    tokio_test::block_on(async {
        let mut volume = engines
            .volumes
            .create(volume, VolumeEvent::AllocationRequested, &[])
            .await
            .expect("create");
        engines
            .volumes
            .transition(&mut volume, VolumeEvent::CreateRequested)
            .await
            .expect("creating");
        engines
            .volumes
            .transition(&mut volume, VolumeEvent::OperationSucceeded)
            .await
            .expect("ready");
        volume
    })
}

fn bench_table_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition_table");
    group.throughput(Throughput::Elements(1));

    let table = volume_transitions().expect("table");
    group.bench_function("next", |b| {
        b.iter(|| table.next(black_box(VolumeState::Ready), black_box(VolumeEvent::ResizeRequested)));
    });

    group.bench_function("build_and_check", |b| {
        b.iter(|| {
            let table = volume_transitions().expect("table");
            table.check_soundness().expect("sound");
        });
    });

    group.finish();
}

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_machine");
    group.throughput(Throughput::Elements(2));

    let engines = engines();
    let mut volume = ready_volume(&engines, "vol-bench");

    group.bench_function("resize_round_trip", |b| {
        b.iter(|| {
            tokio_test::block_on(async {
                engines
                    .volumes
                    .transition(&mut volume, VolumeEvent::ResizeRequested)
                    .await
                    .expect("resizing");
                engines
                    .volumes
                    .transition(&mut volume, VolumeEvent::OperationSucceeded)
                    .await
                    .expect("ready");
            })
        });
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_machine");
    group.throughput(Throughput::Elements(16));

    let engines = engines();
    let volume = ready_volume(&engines, "vol-contended");

    group.bench_function("contended_start_event", |b| {
        b.iter(|| {
            tokio_test::block_on(async {
                let current = engines.volumes.load(volume.id()).await.expect("load");
                let attempts = (0..16).map(|_| {
                    let volumes = engines.volumes.clone();
                    let mut copy = current.clone();
                    async move { volumes.transition(&mut copy, VolumeEvent::ResizeRequested).await }
                });
                let won = futures::future::join_all(attempts)
                    .await
                    .into_iter()
                    .filter(Result::is_ok)
                    .count();
                assert_eq!(won, 1);

                let mut resizing = engines.volumes.load(volume.id()).await.expect("load");
                engines
                    .volumes
                    .transition(&mut resizing, VolumeEvent::OperationFailed)
                    .await
                    .expect("ready");
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_table_lookup, bench_round_trip, bench_contended);
criterion_main!(benches);

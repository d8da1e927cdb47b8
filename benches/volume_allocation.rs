//! Benchmark for number allocation and lock acquisition
//!
//! Both run inside every volume definition request.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use drbd_controller::controller::locks::{LockCoordinator, LockObj, LockRequest, LockTarget};
use drbd_controller::controller::number_pool::{next_free_volume_number, MinorNumberPool};
use drbd_controller::{ResourceName, VolumeNumber};
use std::collections::BTreeSet;

fn bench_volume_numbers(c: &mut Criterion) {
    let mut group = c.benchmark_group("volume_numbers");
    group.throughput(Throughput::Elements(1));
    let resource = ResourceName::new("bench-rsc").unwrap();

    for used_count in [0i64, 64, 4096] {
        let used: BTreeSet<VolumeNumber> = (0..used_count)
            .map(|nr| VolumeNumber::new(nr).unwrap())
            .collect();
        let reserved = BTreeSet::new();

        group.bench_with_input(
            BenchmarkId::new("next_free", used_count),
            &used,
            |b, used| {
                b.iter(|| next_free_volume_number(black_box(&resource), used, &reserved));
            },
        );
    }

    group.finish();
}

fn bench_minor_numbers(c: &mut Criterion) {
    let mut group = c.benchmark_group("minor_numbers");
    group.throughput(Throughput::Elements(1));

    group.bench_function("reserve_release", |b| {
        let pool = MinorNumberPool::new();
        pool.rebuild((1000..2000).map(|nr| drbd_controller::MinorNumber::new(nr).unwrap()));
        b.iter(|| {
            let nr = pool.reserve(black_box(None)).unwrap();
            pool.release(nr);
        });
    });

    group.finish();
}

fn bench_lock_acquisition(c: &mut Criterion) {
    let mut group = c.benchmark_group("locks");
    group.throughput(Throughput::Elements(1));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let coordinator = LockCoordinator::new();
    let names: Vec<ResourceName> = (0..256)
        .map(|i| ResourceName::new(format!("rsc-{:03}", i)).unwrap())
        .collect();

    group.bench_function("rsc_dfn_scope", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let request = LockRequest::new()
                .read(LockTarget::Map(LockObj::NodesMap))
                .read(LockTarget::Map(LockObj::RscDfnMap))
                .write(LockTarget::ResourceDefinition(
                    names[counter % names.len()].clone(),
                ));
            runtime.block_on(async {
                let mut scope = coordinator.acquire_request(black_box(&request)).await.unwrap();
                scope.release();
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_volume_numbers,
    bench_minor_numbers,
    bench_lock_acquisition,
);
criterion_main!(benches);

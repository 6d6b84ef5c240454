use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tabula_core::{
    ContextId, CoordinatorConfig, IdLayout, Registry, ResourceHandle, ResourceId, ResourceKind,
};
use tabula_coord::FrameCoordinator;
use tabula_gpu::HeadlessBackend;

fn bench_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("tabula_registry");

    let registry = Registry::new();
    for id in 0..64 {
        registry.insert(ResourceId::new(id), ResourceHandle::new(ResourceKind::Buffer, id));
    }

    group.bench_function("get_as_hit", |b| {
        b.iter(|| registry.get_as::<u32>(ResourceId::new(17)).unwrap());
    });

    registry.claim(ResourceId::new(100), ContextId::worker(0)).unwrap();
    group.bench_function("checked_overwrite", |b| {
        b.iter(|| {
            registry
                .insert_as(
                    ContextId::worker(0),
                    ResourceId::new(100),
                    ResourceHandle::new(ResourceKind::RenderBundle, 0u64),
                )
                .unwrap()
        });
    });

    group.finish();
}

fn bench_frame_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("tabula_frame_cycle");
    let runtime = tokio::runtime::Runtime::new().unwrap();

    for workers in [1usize, 2, 4] {
        let config = CoordinatorConfig {
            workers,
            ..CoordinatorConfig::default()
        };
        let mut coordinator = runtime
            .block_on(FrameCoordinator::start(
                HeadlessBackend::default(),
                Arc::new(Registry::new()),
                &config,
                &IdLayout::default(),
            ))
            .unwrap();

        group.bench_with_input(BenchmarkId::new("headless", workers), &workers, |b, _| {
            b.iter(|| runtime.block_on(coordinator.cycle()).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_registry, bench_frame_cycle);
criterion_main!(benches);

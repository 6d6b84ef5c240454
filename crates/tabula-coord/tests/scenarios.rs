use std::sync::Arc;
use std::time::Duration;

use tabula_core::{
    BenchConfig, ContextId, CoordinatorConfig, FrameMode, IdLayout, Registry, ResourceHandle,
    ResourceId, ResourceKind, SharedIds, TabulaError, TabulaResult,
};
use tabula_coord::{
    run_probe, BenchHarness, CycleOutcome, FrameCoordinator, ProbeMode, ProbeOptions, SkipReason,
};
use tabula_gpu::headless::PipelineKind;
use tabula_gpu::{Backend, FaultPlan, HeadlessBackend, HeadlessEncoder, RecordedBundle};

fn config(workers: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        workers,
        frame_interval_ms: 1,
        ..CoordinatorConfig::default()
    }
}

async fn start(
    backend: HeadlessBackend,
    config: &CoordinatorConfig,
) -> FrameCoordinator<HeadlessBackend> {
    FrameCoordinator::start(backend, Registry::shared(), config, &IdLayout::default())
        .await
        .expect("coordinator should start")
}

#[tokio::test]
async fn test_two_workers_gather_outputs_and_submit_once() {
    let backend = HeadlessBackend::default();
    let device = backend.device();
    let mut coordinator = start(backend, &config(2)).await;
    let registry = Arc::clone(coordinator.registry());

    for id in [2, 4, 5] {
        assert!(registry.lookup(ResourceId::new(id)).unwrap().sealed);
    }
    assert_eq!(coordinator.output_ids(), &[ResourceId::new(10), ResourceId::new(11)]);

    let outcome = coordinator.cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Submitted { cycle: 0, batch_len: 2 });

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    let batch = &submissions[0];
    assert_eq!(batch.cycle, 0);
    for (worker, id) in [(0usize, 10u32), (1, 11)] {
        let stored = registry
            .get_as::<RecordedBundle>(ResourceId::new(id))
            .unwrap();
        assert!(Arc::ptr_eq(&stored, &batch.bundles[worker]));
        assert_eq!(stored.worker, worker);
    }
}

#[test]
fn test_removed_entry_is_not_found() {
    let registry = Registry::new();
    registry.insert(ResourceId::new(1), ResourceHandle::new(ResourceKind::Buffer, 0u32));
    assert!(registry.remove(ResourceId::new(1)).is_some());
    let err = registry.get(ResourceId::new(1)).unwrap_err();
    assert!(matches!(err, TabulaError::NotFound { id } if id == ResourceId::new(1)));
}

#[tokio::test]
async fn test_bench_four_workers_five_hundred_trials() {
    let config = BenchConfig {
        max_workers: 4,
        dispatch_count: 100_000,
        trials: 500,
        warmup: true,
        wait_for_device: false,
    };
    let mut harness = BenchHarness::new(
        HeadlessBackend::default(),
        Registry::shared(),
        config,
        &IdLayout::default(),
    )
    .unwrap();
    assert_eq!(tabula_coord::split_dispatches(100_000, 4), vec![25_000; 4]);

    let stats = harness.run_setting(4).await.unwrap();
    assert_eq!(stats.per_worker.len(), 4);
    for series in stats.per_worker.iter().chain(std::iter::once(&stats.trial)) {
        let sorted = series.sorted();
        assert_eq!(sorted.len(), 500);
        assert!(sorted.windows(2).all(|w| w[0] <= w[1]));
    }
    assert_eq!(stats.worker_pooled().len(), 2_000);
    assert!(stats.device.is_none());
}

#[tokio::test]
async fn test_sentinel_path_still_applies_local_write() {
    let report = run_probe(ProbeOptions {
        mode: ProbeMode::Direct,
        pin_device: true,
    })
    .await
    .unwrap();
    assert!(!report.transferred);
    assert_eq!(report.readback, vec![0, 77777]);

    let report = run_probe(ProbeOptions {
        mode: ProbeMode::Direct,
        pin_device: false,
    })
    .await
    .unwrap();
    assert_eq!(report.readback, vec![33333, 77777]);
}

#[tokio::test]
async fn test_jittered_workers_never_submit_stale_artifacts() {
    let faults = FaultPlan::none().with_delay(|worker, cycle| {
        Duration::from_millis((worker as u64 * 7 + cycle * 13) % 5)
    });
    let backend = HeadlessBackend::new(faults);
    let device = backend.device();
    let mut coordinator = start(backend, &config(4)).await;

    let stats = coordinator.run(Some(25)).await.unwrap();
    assert_eq!(stats.submitted, 25);

    for batch in device.submissions() {
        let workers: Vec<usize> = batch.bundles.iter().map(|b| b.worker).collect();
        assert_eq!(workers, vec![0, 1, 2, 3]);
        assert!(batch.bundles.iter().all(|b| b.cycle == batch.cycle));
    }
}

#[tokio::test]
async fn test_worker_failure_skips_whole_frame() {
    let backend = HeadlessBackend::new(FaultPlan::none().with_failing_worker(1, 2));
    let device = backend.device();
    let mut coordinator = start(backend, &config(2)).await;

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(coordinator.cycle().await.unwrap());
    }
    assert!(outcomes[0].is_submitted());
    assert!(outcomes[1].is_submitted());
    for outcome in &outcomes[2..] {
        assert!(matches!(
            outcome,
            CycleOutcome::Skipped { reason: SkipReason::WorkerFailed { worker: 1, .. }, .. }
        ));
    }
    assert_eq!(device.submission_count(), 2);
    assert_eq!(coordinator.stats().skipped, 2);
}

#[tokio::test]
async fn test_barrier_timeout_skips_then_recovers() {
    let faults = FaultPlan::none().with_delay(|worker, cycle| {
        if worker == 0 && cycle == 0 {
            Duration::from_millis(300)
        } else {
            Duration::ZERO
        }
    });
    let backend = HeadlessBackend::new(faults);
    let device = backend.device();
    let config = CoordinatorConfig {
        barrier_timeout_ms: Some(200),
        ..config(2)
    };
    let mut coordinator = start(backend, &config).await;

    let first = coordinator.cycle().await.unwrap();
    assert_eq!(
        first,
        CycleOutcome::Skipped {
            cycle: 0,
            reason: SkipReason::BarrierTimeout { completed: 1, expected: 2 }
        }
    );

    let second = coordinator.cycle().await.unwrap();
    assert_eq!(second, CycleOutcome::Submitted { cycle: 1, batch_len: 2 });
    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert!(submissions[0].bundles.iter().all(|b| b.cycle == 1));
}

#[tokio::test]
async fn test_outputs_reject_foreign_writers() {
    let coordinator = start(HeadlessBackend::default(), &config(2)).await;
    let registry = coordinator.registry();
    let intruder = ResourceHandle::new(ResourceKind::RenderBundle, 0u8);

    let err = registry
        .insert_as(ContextId::Orchestrator, ResourceId::new(10), intruder.clone())
        .unwrap_err();
    assert!(matches!(err, TabulaError::WriterConflict { .. }));

    let err = registry
        .insert_as(ContextId::worker(0), ResourceId::new(2), intruder)
        .unwrap_err();
    assert!(matches!(err, TabulaError::Sealed { .. }));
}

/// Headless scene whose pipeline is pinned to the orchestrator.
struct PinnedPipeline(HeadlessBackend);

impl Backend for PinnedPipeline {
    type Encoder = HeadlessEncoder;

    fn name(&self) -> &'static str {
        "pinned"
    }

    fn publish_device(&mut self, registry: &Registry, id: ResourceId) -> TabulaResult<()> {
        self.0.publish_device(registry, id)
    }

    fn publish_scene(
        &mut self,
        registry: &Registry,
        ids: &IdLayout,
        workers: usize,
    ) -> TabulaResult<Vec<SharedIds>> {
        let shared = self.0.publish_scene(registry, ids, workers)?;
        let pipeline = self.0.device().create_pipeline("pinned-pipeline", PipelineKind::Render);
        registry.insert(
            ids.pipeline,
            ResourceHandle::new(ResourceKind::Pipeline, pipeline).pinned_to(ContextId::Orchestrator),
        );
        Ok(shared)
    }

    fn publish_frame_target(
        &mut self,
        registry: &Registry,
        id: ResourceId,
        cycle: u64,
    ) -> TabulaResult<()> {
        self.0.publish_frame_target(registry, id, cycle)
    }

    fn submit(&mut self, cycle: u64, batch: &[ResourceHandle]) -> TabulaResult<()> {
        self.0.submit(cycle, batch)
    }

    fn present(&mut self) -> TabulaResult<()> {
        self.0.present()
    }

    fn wait_idle(&mut self) -> TabulaResult<()> {
        self.0.wait_idle()
    }
}

#[tokio::test]
async fn test_untransferable_scene_disables_frame_loop() {
    let result = FrameCoordinator::start(
        PinnedPipeline(HeadlessBackend::default()),
        Registry::shared(),
        &config(2),
        &IdLayout::default(),
    )
    .await;
    assert!(matches!(result, Err(TabulaError::Transfer(_))));
}

#[tokio::test]
async fn test_eleven_workers_need_a_wider_layout() {
    let result = FrameCoordinator::start(
        HeadlessBackend::default(),
        Registry::shared(),
        &config(11),
        &IdLayout::default(),
    )
    .await;
    assert!(matches!(result, Err(TabulaError::InvalidArgument(_))));

    let backend = HeadlessBackend::default();
    let device = backend.device();
    let ids = IdLayout {
        output_base: ResourceId::new(100),
        ..IdLayout::default()
    };
    let mut coordinator = FrameCoordinator::start(backend, Registry::shared(), &config(11), &ids)
        .await
        .unwrap();
    let stats = coordinator.run(Some(3)).await.unwrap();
    assert_eq!(stats.submitted, 3);
    for batch in device.submissions() {
        let workers: Vec<usize> = batch.bundles.iter().map(|b| b.worker).collect();
        assert_eq!(workers, (0..11).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_output_base_at_max_id_is_rejected() {
    let ids = IdLayout {
        output_base: ResourceId::new(u32::MAX),
        ..IdLayout::default()
    };
    let registry = Registry::shared();
    let result =
        FrameCoordinator::start(HeadlessBackend::default(), Arc::clone(&registry), &config(2), &ids)
            .await;
    assert!(matches!(result, Err(TabulaError::InvalidArgument(_))));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_command_buffer_mode_submits_all_buffers_at_once() {
    let faults = FaultPlan::none().with_delay(|worker, cycle| {
        Duration::from_millis((worker as u64 * 3 + cycle * 5) % 4)
    });
    let backend = HeadlessBackend::new(faults);
    let device = backend.device();
    let config = CoordinatorConfig {
        mode: FrameMode::CommandBuffer,
        ..config(3)
    };
    let mut coordinator = start(backend, &config).await;
    let target = IdLayout::default().frame_target;
    assert_eq!(coordinator.registry().owner(target), Some(ContextId::Orchestrator));

    let stats = coordinator.run(Some(6)).await.unwrap();
    assert_eq!(stats.submitted, 6);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 6);
    for batch in &submissions {
        assert!(batch.bundles.is_empty());
        let workers: Vec<usize> = batch.command_buffers.iter().map(|c| c.worker).collect();
        assert_eq!(workers, vec![0, 1, 2]);
        for commands in &batch.command_buffers {
            assert_eq!(commands.cycle, batch.cycle);
            assert_eq!(commands.target_cycle, batch.cycle);
        }
    }
    let view = coordinator
        .registry()
        .get_as::<tabula_gpu::HeadlessTextureView>(target)
        .unwrap();
    assert_eq!(view.cycle, 5);
}

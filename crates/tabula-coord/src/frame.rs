//! The orchestrator's frame loop.
//!
//! Each cycle resets the barrier, broadcasts an encode request tagged with the cycle
//! number, waits until every worker has answered that cycle, then gathers the
//! artifacts from the registry in worker-index order and submits them as one batch.
//! A cycle is either submitted whole or skipped; there are no partial batches.
//!
//! In [`FrameMode::CommandBuffer`] the orchestrator also publishes the cycle's render
//! target before broadcasting, and workers record complete command buffers against it.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;

use tabula_core::{
    ContextId, CoordinatorConfig, FrameMode, IdLayout, Registry, ResourceHandle, ResourceId,
    TabulaError, TabulaResult,
};
use tabula_gpu::Backend;

use crate::barrier::{FrameState, Recorded};
use crate::protocol::{InitMessage, WorkerMessage};
use crate::worker::WorkerPool;

/// Why a cycle was not submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BarrierTimeout { completed: usize, expected: usize },
    WorkerFailed { worker: usize, message: String },
    /// The registry did not hold the artifact the worker reported for this cycle.
    Gather(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Submitted { cycle: u64, batch_len: usize },
    Skipped { cycle: u64, reason: SkipReason },
}

impl CycleOutcome {
    pub fn cycle(&self) -> u64 {
        match self {
            CycleOutcome::Submitted { cycle, .. } | CycleOutcome::Skipped { cycle, .. } => *cycle,
        }
    }

    pub fn is_submitted(&self) -> bool {
        matches!(self, CycleOutcome::Submitted { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub submitted: u64,
    pub skipped: u64,
}

impl FrameStats {
    pub fn cycles(&self) -> u64 {
        self.submitted + self.skipped
    }
}

pub struct FrameCoordinator<B: Backend> {
    backend: B,
    registry: Arc<Registry>,
    pool: WorkerPool<B::Encoder>,
    state: FrameState,
    output_ids: Vec<ResourceId>,
    frame_target: Option<ResourceId>,
    config: CoordinatorConfig,
    next_cycle: u64,
    stats: FrameStats,
}

impl<B: Backend> FrameCoordinator<B> {
    /// Publish the scene, spawn and initialize the workers.
    ///
    /// Fails with [`TabulaError::InvalidArgument`] if `ids` cannot give every worker
    /// its own ids, and if any worker could not be initialized; the interactive path
    /// is then unavailable.
    pub async fn start(
        mut backend: B,
        registry: Arc<Registry>,
        config: &CoordinatorConfig,
        ids: &IdLayout,
    ) -> TabulaResult<Self> {
        let workers = config.workers;
        ids.validate(workers)?;
        let output_ids = (0..workers)
            .map(|i| ids.output_id(i))
            .collect::<TabulaResult<Vec<_>>>()?;

        let shared = backend.publish_scene(&registry, ids, workers)?;
        for (index, id) in output_ids.iter().enumerate() {
            registry.claim(*id, ContextId::worker(index))?;
        }
        let frame_target = match config.mode {
            FrameMode::RenderBundle => None,
            FrameMode::CommandBuffer => {
                registry.claim(ids.frame_target, ContextId::Orchestrator)?;
                Some(ids.frame_target)
            }
        };
        let mut pool = WorkerPool::<B::Encoder>::spawn(workers)?;

        let inits = shared
            .into_iter()
            .enumerate()
            .map(|(index, shared)| InitMessage {
                index,
                output_id: output_ids[index],
                shared,
                frame_target,
                width: config.width,
                height: config.height,
                registry: Arc::clone(&registry),
            })
            .collect();
        pool.initialize(inits).await?;

        tracing::info!(
            "frame coordinator ready: {} workers on {} backend, {}, {}x{}",
            workers,
            backend.name(),
            config.mode,
            config.width,
            config.height
        );

        Ok(Self {
            backend,
            registry,
            pool,
            state: FrameState::new(workers),
            output_ids,
            frame_target,
            config: config.clone(),
            next_cycle: 0,
            stats: FrameStats::default(),
        })
    }

    /// Run one complete cycle.
    ///
    /// Worker failures, barrier timeouts and stale artifacts skip the cycle. Channel
    /// and device submission errors are returned.
    pub async fn cycle(&mut self) -> TabulaResult<CycleOutcome> {
        let cycle = self.next_cycle;
        self.next_cycle += 1;

        self.state.reset(cycle);
        if let Some(target) = self.frame_target {
            self.backend.publish_frame_target(&self.registry, target, cycle)?;
        }
        self.pool.broadcast(|_| WorkerMessage::Encode { cycle })?;

        match self.config.barrier_timeout() {
            Some(limit) => match tokio::time::timeout(limit, self.await_barrier()).await {
                Ok(waited) => waited?,
                Err(_) => {
                    tracing::warn!("{}; skipping frame", self.state.timeout_error());
                    return Ok(self.skip(SkipReason::BarrierTimeout {
                        completed: self.state.completed(),
                        expected: self.state.worker_count(),
                    }));
                }
            },
            None => self.await_barrier().await?,
        }

        if let Some((worker, message)) = self.state.first_failure() {
            tracing::warn!("cycle {}: worker {} failed: {}; skipping frame", cycle, worker, message);
            let reason = SkipReason::WorkerFailed {
                worker,
                message: message.to_string(),
            };
            return Ok(self.skip(reason));
        }

        let batch = match self.gather() {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!("cycle {}: {}; skipping frame", cycle, e);
                return Ok(self.skip(SkipReason::Gather(e.to_string())));
            }
        };

        self.backend.submit(cycle, &batch)?;
        self.backend.present()?;
        self.stats.submitted += 1;
        tracing::trace!("cycle {} submitted with {} artifacts", cycle, batch.len());

        Ok(CycleOutcome::Submitted {
            cycle,
            batch_len: batch.len(),
        })
    }

    // Barrier wait. A timeout surfaces as an error from the enclosing `timeout`.
    async fn await_barrier(&mut self) -> TabulaResult<()> {
        while !self.state.is_ready() {
            let completion = self.pool.recv().await?;
            match self.state.record(&completion) {
                Recorded::Counted => {}
                Recorded::Stale => tracing::debug!(
                    "discarding {:?} from worker {} during cycle {}",
                    completion.signal,
                    completion.worker,
                    self.state.cycle()
                ),
                Recorded::Duplicate | Recorded::UnknownWorker => tracing::warn!(
                    "unexpected completion {:?} from worker {} during cycle {}",
                    completion.signal,
                    completion.worker,
                    self.state.cycle()
                ),
            }
        }
        Ok(())
    }

    fn gather(&self) -> TabulaResult<Vec<ResourceHandle>> {
        let mut batch = Vec::with_capacity(self.output_ids.len());
        for (worker, id) in self.output_ids.iter().enumerate() {
            let entry = self.registry.lookup(*id)?;
            let expected = self
                .state
                .generation(worker)
                .ok_or_else(|| TabulaError::worker(worker, "no artifact reported"))?;
            if entry.generation != expected {
                return Err(TabulaError::StaleArtifact {
                    id: *id,
                    expected,
                    found: entry.generation,
                });
            }
            batch.push(entry.handle);
        }
        Ok(batch)
    }

    fn skip(&mut self, reason: SkipReason) -> CycleOutcome {
        self.stats.skipped += 1;
        CycleOutcome::Skipped {
            cycle: self.state.cycle(),
            reason,
        }
    }

    /// Drive cycles at the configured frame interval, for `frames` cycles or forever.
    pub async fn run(&mut self, frames: Option<u64>) -> TabulaResult<FrameStats> {
        let mut ticker = tokio::time::interval(self.config.frame_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut remaining = frames;
        while remaining != Some(0) {
            ticker.tick().await;
            self.cycle().await?;
            remaining = remaining.map(|n| n - 1);
        }

        tracing::info!(
            "frame loop finished: {} submitted, {} skipped",
            self.stats.submitted,
            self.stats.skipped
        );
        Ok(self.stats)
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn worker_count(&self) -> usize {
        self.pool.len()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn output_ids(&self) -> &[ResourceId] {
        &self.output_ids
    }

    pub fn mode(&self) -> FrameMode {
        self.config.mode
    }

    /// Where the per-cycle render target is published, in command-buffer mode.
    pub fn frame_target(&self) -> Option<ResourceId> {
        self.frame_target
    }
}

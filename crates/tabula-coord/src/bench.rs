//! Parallel encoding benchmark.
//!
//! For each worker count the harness spawns a fresh pool bound to the shared device,
//! splits a fixed dispatch budget across the active workers, and times each trial
//! from the first request to the last completion. Workers time their own encode and
//! report it in the completion.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use tabula_core::{BenchConfig, IdLayout, Registry, SharedIds, TabulaError, TabulaResult};
use tabula_gpu::Backend;

use crate::protocol::{InitMessage, Signal, WorkerMessage};
use crate::stats::{BenchRow, TrialStatistics};
use crate::worker::WorkerPool;

/// Split `total` dispatches across `workers`. The remainder goes one each to the
/// lowest indices, so the shares always sum to `total`.
pub fn split_dispatches(total: u32, workers: usize) -> Vec<u32> {
    if workers == 0 {
        return Vec::new();
    }
    let workers_u32 = workers as u32;
    let base = total / workers_u32;
    let remainder = (total % workers_u32) as usize;
    (0..workers)
        .map(|index| base + u32::from(index < remainder))
        .collect()
}

/// Results of a full sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchReport {
    pub backend: String,
    pub dispatch_count: u32,
    pub trials: usize,
    pub rows: Vec<BenchRow>,
}

pub struct BenchHarness<B: Backend> {
    backend: B,
    registry: Arc<Registry>,
    config: BenchConfig,
    ids: IdLayout,
    next_trial: u64,
}

impl<B: Backend> BenchHarness<B> {
    /// Publish the device at `ids.device` and prepare to run.
    ///
    /// Fails with [`TabulaError::InvalidArgument`] if `ids` cannot hold
    /// `max_workers` outputs beside the device.
    pub fn new(
        mut backend: B,
        registry: Arc<Registry>,
        config: BenchConfig,
        ids: &IdLayout,
    ) -> TabulaResult<Self> {
        if config.trials == 0 {
            return Err(TabulaError::InvalidArgument("bench needs at least one trial".into()));
        }
        ids.validate_for_bench(config.max_workers)?;
        backend.publish_device(&registry, ids.device)?;
        Ok(Self {
            backend,
            registry,
            config,
            ids: ids.clone(),
            next_trial: 0,
        })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run every worker count from one to the configured maximum.
    pub async fn sweep(&mut self) -> TabulaResult<BenchReport> {
        let mut rows = Vec::with_capacity(self.config.max_workers);
        for workers in 1..=self.config.max_workers {
            let stats = self.run_setting(workers).await?;
            let row = stats.row();
            tracing::info!(
                "{} workers: median trial {:.3} ms, median worker {:.3} ms",
                workers,
                row.median_trial_ms,
                row.median_worker_ms
            );
            rows.push(row);
        }
        Ok(BenchReport {
            backend: self.backend.name().to_string(),
            dispatch_count: self.config.dispatch_count,
            trials: self.config.trials,
            rows,
        })
    }

    /// Collect the configured number of trials at one worker count.
    pub async fn run_setting(&mut self, workers: usize) -> TabulaResult<TrialStatistics> {
        let inits = (0..workers)
            .map(|index| {
                Ok(InitMessage {
                    index,
                    output_id: self.ids.output_id(index)?,
                    shared: SharedIds::device_only(self.ids.device),
                    frame_target: None,
                    width: 0,
                    height: 0,
                    registry: Arc::clone(&self.registry),
                })
            })
            .collect::<TabulaResult<Vec<_>>>()?;
        let mut pool = WorkerPool::<B::Encoder>::spawn(workers)?;
        pool.initialize(inits).await?;

        if self.config.warmup {
            let mut discard = TrialStatistics::new(workers, self.config.dispatch_count, 2, false);
            self.trial(&mut pool, 1, &mut discard).await?;
            self.trial(&mut pool, workers, &mut discard).await?;
            tracing::debug!("warm-up done at {} workers", workers);
        }

        let mut stats = TrialStatistics::new(
            workers,
            self.config.dispatch_count,
            self.config.trials,
            self.config.wait_for_device,
        );
        for _ in 0..self.config.trials {
            self.trial(&mut pool, workers, &mut stats).await?;
        }
        Ok(stats)
    }

    async fn trial(
        &mut self,
        pool: &mut WorkerPool<B::Encoder>,
        active: usize,
        stats: &mut TrialStatistics,
    ) -> TabulaResult<()> {
        let trial = self.next_trial;
        self.next_trial += 1;
        let shares = split_dispatches(self.config.dispatch_count, active);

        let start = Instant::now();
        for (worker, dispatch_count) in shares.into_iter().enumerate() {
            pool.send(
                worker,
                WorkerMessage::Workload {
                    trial,
                    dispatch_count,
                },
            )?;
        }

        let mut received = 0;
        while received < active {
            let completion = pool.recv().await?;
            if completion.signal != Signal::Trial(trial) {
                tracing::debug!("discarding {:?} during trial {}", completion.signal, trial);
                continue;
            }
            completion.outcome?;
            if let (Some(series), Some(elapsed)) =
                (stats.per_worker.get_mut(completion.worker), completion.elapsed)
            {
                series.push(elapsed);
            }
            received += 1;
        }
        stats.trial.push(start.elapsed());

        if let Some(device) = stats.device.as_mut() {
            self.backend.wait_idle()?;
            device.push(start.elapsed());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::ResourceId;
    use tabula_gpu::HeadlessBackend;

    #[test]
    fn test_split_even() {
        assert_eq!(split_dispatches(100_000, 4), vec![25_000; 4]);
    }

    #[test]
    fn test_split_remainder_goes_to_lowest_indices() {
        let shares = split_dispatches(10, 3);
        assert_eq!(shares, vec![4, 3, 3]);
        assert_eq!(shares.iter().sum::<u32>(), 10);
        assert_eq!(split_dispatches(2, 4), vec![1, 1, 0, 0]);
        assert!(split_dispatches(5, 0).is_empty());
    }

    #[tokio::test]
    async fn test_setting_collects_one_sample_per_trial_per_worker() {
        let config = BenchConfig {
            max_workers: 2,
            dispatch_count: 1_000,
            trials: 7,
            warmup: true,
            wait_for_device: true,
        };
        let backend = HeadlessBackend::default();
        let device = backend.device();
        let mut harness =
            BenchHarness::new(backend, Registry::shared(), config, &IdLayout::default()).unwrap();

        let stats = harness.run_setting(2).await.unwrap();
        assert_eq!(stats.trials(), 7);
        assert!(stats.per_worker.iter().all(|s| s.len() == 7));
        assert_eq!(stats.device.as_ref().map(|d| d.len()), Some(7));
        assert_eq!(device.idle_waits(), 7);
    }

    #[tokio::test]
    async fn test_missing_device_aborts() {
        let registry = Registry::shared();
        let mut harness = BenchHarness::new(
            HeadlessBackend::default(),
            Arc::clone(&registry),
            BenchConfig::default(),
            &IdLayout::default(),
        )
        .unwrap();
        registry.remove(ResourceId::new(1));
        let err = harness.run_setting(1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_zero_trials_rejected() {
        let config = BenchConfig {
            trials: 0,
            ..BenchConfig::default()
        };
        assert!(BenchHarness::new(
            HeadlessBackend::default(),
            Registry::shared(),
            config,
            &IdLayout::default()
        )
        .is_err());
    }

    #[test]
    fn test_output_range_must_fit_below_max_id() {
        let config = BenchConfig {
            max_workers: 2,
            ..BenchConfig::default()
        };
        let ids = IdLayout {
            output_base: ResourceId::new(u32::MAX),
            ..IdLayout::default()
        };
        let result = BenchHarness::new(HeadlessBackend::default(), Registry::shared(), config, &ids);
        assert!(matches!(result, Err(TabulaError::InvalidArgument(_))));
    }

    #[test]
    fn test_output_range_must_not_cover_device() {
        let config = BenchConfig {
            max_workers: 4,
            ..BenchConfig::default()
        };
        let ids = IdLayout {
            output_base: ResourceId::new(0),
            ..IdLayout::default()
        };
        let registry = Registry::shared();
        let result = BenchHarness::new(HeadlessBackend::default(), Arc::clone(&registry), config, &ids);
        assert!(matches!(result, Err(TabulaError::InvalidArgument(_))));
        assert!(registry.is_empty());
    }
}

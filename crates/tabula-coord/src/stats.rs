//! Timing series and summary statistics for benchmark runs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A series of duration samples.
#[derive(Debug, Clone, Default)]
pub struct DurationSeries {
    samples: Vec<Duration>,
}

impl DurationSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: Duration) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    /// The samples in ascending order.
    pub fn sorted(&self) -> Vec<Duration> {
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        sorted
    }

    /// The element at index `len / 2` of the sorted series: the upper median for
    /// even lengths.
    pub fn median(&self) -> Option<Duration> {
        let sorted = self.sorted();
        sorted.get(sorted.len() / 2).copied()
    }

    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }

    /// Every sample of every series, as one series.
    pub fn pooled<'a>(series: impl IntoIterator<Item = &'a DurationSeries>) -> Self {
        Self {
            samples: series
                .into_iter()
                .flat_map(|s| s.samples.iter().copied())
                .collect(),
        }
    }
}

/// All timings collected at one worker-count setting.
#[derive(Debug, Clone)]
pub struct TrialStatistics {
    pub workers: usize,
    pub dispatch_count: u32,
    /// One series per worker index, each with one sample per trial.
    pub per_worker: Vec<DurationSeries>,
    /// Orchestrator-observed wall time from first request to last completion.
    pub trial: DurationSeries,
    /// Trial time extended to device idle, when requested.
    pub device: Option<DurationSeries>,
}

impl TrialStatistics {
    pub fn new(workers: usize, dispatch_count: u32, trials: usize, wait_for_device: bool) -> Self {
        Self {
            workers,
            dispatch_count,
            per_worker: (0..workers).map(|_| DurationSeries::with_capacity(trials)).collect(),
            trial: DurationSeries::with_capacity(trials),
            device: wait_for_device.then(|| DurationSeries::with_capacity(trials)),
        }
    }

    pub fn trials(&self) -> usize {
        self.trial.len()
    }

    /// Per-worker samples of all workers, pooled.
    pub fn worker_pooled(&self) -> DurationSeries {
        DurationSeries::pooled(&self.per_worker)
    }

    pub fn row(&self) -> BenchRow {
        let pooled = self.worker_pooled();
        BenchRow {
            workers: self.workers,
            dispatch_count: self.dispatch_count,
            trials: self.trials(),
            median_worker_ms: millis(pooled.median()),
            mean_worker_ms: millis(pooled.mean()),
            median_trial_ms: millis(self.trial.median()),
            mean_trial_ms: millis(self.trial.mean()),
            median_device_ms: self.device.as_ref().map(|d| millis(d.median())),
            mean_device_ms: self.device.as_ref().map(|d| millis(d.mean())),
        }
    }
}

fn millis(duration: Option<Duration>) -> f64 {
    duration.map_or(0.0, |d| d.as_secs_f64() * 1000.0)
}

/// Summary of one worker-count setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchRow {
    pub workers: usize,
    pub dispatch_count: u32,
    pub trials: usize,
    pub median_worker_ms: f64,
    pub mean_worker_ms: f64,
    pub median_trial_ms: f64,
    pub mean_trial_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_device_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_device_ms: Option<f64>,
}

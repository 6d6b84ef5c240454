use serde::{Deserialize, Serialize};

use crate::error::{TabulaError, TabulaResult};
use crate::handle::ResourceId;

/// What a worker produces for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FrameMode {
    /// A render bundle, executed by the orchestrator inside its own render pass.
    #[default]
    RenderBundle,
    /// A finished command buffer that renders into the frame target the orchestrator
    /// publishes each cycle. All buffers go to the queue in one submission.
    CommandBuffer,
}

impl std::str::FromStr for FrameMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "render-bundle" => Ok(FrameMode::RenderBundle),
            "command-buffer" => Ok(FrameMode::CommandBuffer),
            other => Err(format!(
                "unknown frame mode '{}' (expected render-bundle or command-buffer)",
                other
            )),
        }
    }
}

impl std::fmt::Display for FrameMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FrameMode::RenderBundle => "render-bundle",
            FrameMode::CommandBuffer => "command-buffer",
        })
    }
}

/// Frame coordinator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub workers: usize,
    pub width: u32,
    pub height: u32,
    pub mode: FrameMode,
    /// Presentation tick in milliseconds.
    pub frame_interval_ms: u64,
    /// Deadline for the per-frame completion barrier. `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub barrier_timeout_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            width: 640,
            height: 640,
            mode: FrameMode::RenderBundle,
            frame_interval_ms: 16,
            barrier_timeout_ms: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.frame_interval_ms.max(1))
    }

    pub fn barrier_timeout(&self) -> Option<std::time::Duration> {
        self.barrier_timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// Benchmark harness settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Sweep worker counts `1..=max_workers`.
    pub max_workers: usize,
    /// Total dispatches per trial, split across the active workers.
    pub dispatch_count: u32,
    pub trials: usize,
    pub warmup: bool,
    /// Extend the trial time to a device-level "all work done" acknowledgment.
    pub wait_for_device: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            dispatch_count: 100_000,
            trials: 500,
            warmup: true,
            wait_for_device: false,
        }
    }
}

/// Registry layout: where shared resources and worker outputs live.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IdLayout {
    pub device: ResourceId,
    pub pipeline: ResourceId,
    pub color_buffer: ResourceId,
    pub index_buffer: ResourceId,
    /// Per-frame render target in command-buffer mode.
    pub frame_target: ResourceId,
    /// Per-worker position buffers live at `position_base + index`.
    pub position_base: ResourceId,
    /// Worker outputs live at `output_base + index`.
    pub output_base: ResourceId,
}

impl Default for IdLayout {
    fn default() -> Self {
        Self {
            device: ResourceId::new(1),
            pipeline: ResourceId::new(2),
            color_buffer: ResourceId::new(4),
            index_buffer: ResourceId::new(5),
            frame_target: ResourceId::new(6),
            position_base: ResourceId::new(20),
            output_base: ResourceId::new(10),
        }
    }
}

/// A named half-open id range `[start, end)`, widened so the end of a range that
/// reaches `u32::MAX` is representable.
struct IdRange {
    role: &'static str,
    start: u64,
    end: u64,
}

impl IdRange {
    fn single(role: &'static str, id: ResourceId) -> Self {
        let start = u64::from(id.get());
        Self {
            role,
            start,
            end: start + 1,
        }
    }

    fn per_worker(role: &'static str, base: ResourceId, workers: usize) -> TabulaResult<Self> {
        let start = u64::from(base.get());
        let end = u64::try_from(workers)
            .ok()
            .and_then(|n| start.checked_add(n))
            .filter(|end| *end <= u64::from(u32::MAX) + 1)
            .ok_or_else(|| {
                TabulaError::InvalidArgument(format!(
                    "{} for {} workers starting at {} run past the largest resource id",
                    role, workers, base
                ))
            })?;
        Ok(Self { role, start, end })
    }

    fn overlaps(&self, other: &IdRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for IdRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.end - self.start == 1 {
            write!(f, "{} #{}", self.role, self.start)
        } else {
            write!(f, "{} #{}..#{}", self.role, self.start, self.end - 1)
        }
    }
}

fn check_disjoint(workers: usize, ranges: &[IdRange]) -> TabulaResult<()> {
    let ranges: Vec<&IdRange> = ranges.iter().filter(|r| r.end > r.start).collect();
    for (i, a) in ranges.iter().enumerate() {
        if let Some(b) = ranges[i + 1..].iter().find(|b| a.overlaps(b)) {
            return Err(TabulaError::InvalidArgument(format!(
                "id layout for {} workers: {} overlaps {}",
                workers, a, b
            )));
        }
    }
    Ok(())
}

impl IdLayout {
    pub fn output_id(&self, worker: usize) -> TabulaResult<ResourceId> {
        offset_id("output", self.output_base, worker)
    }

    pub fn position_id(&self, worker: usize) -> TabulaResult<ResourceId> {
        offset_id("position buffer", self.position_base, worker)
    }

    /// Check the frame loop layout for `workers` workers: both per-worker ranges fit
    /// below `u32::MAX` and no id serves two roles.
    pub fn validate(&self, workers: usize) -> TabulaResult<()> {
        check_disjoint(
            workers,
            &[
                IdRange::single("device", self.device),
                IdRange::single("pipeline", self.pipeline),
                IdRange::single("color buffer", self.color_buffer),
                IdRange::single("index buffer", self.index_buffer),
                IdRange::single("frame target", self.frame_target),
                IdRange::per_worker("position buffers", self.position_base, workers)?,
                IdRange::per_worker("outputs", self.output_base, workers)?,
            ],
        )
    }

    /// Check the benchmark layout, which only uses the device and the output range.
    pub fn validate_for_bench(&self, workers: usize) -> TabulaResult<()> {
        check_disjoint(
            workers,
            &[
                IdRange::single("device", self.device),
                IdRange::per_worker("outputs", self.output_base, workers)?,
            ],
        )
    }
}

fn offset_id(role: &str, base: ResourceId, worker: usize) -> TabulaResult<ResourceId> {
    base.offset(worker).ok_or_else(|| {
        TabulaError::InvalidArgument(format!(
            "{} id for worker {} past {} overflows",
            role, worker, base
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// wgpu when an adapter is available, headless otherwise.
    #[default]
    Auto,
    Wgpu,
    Headless,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BackendKind::Auto),
            "wgpu" => Ok(BackendKind::Wgpu),
            "headless" => Ok(BackendKind::Headless),
            other => Err(format!("unknown backend '{}' (expected auto, wgpu or headless)", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TabulaConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub bench: BenchConfig,
    #[serde(default)]
    pub ids: IdLayout,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl TabulaConfig {
    pub fn load_from_file(path: &std::path::Path) -> TabulaResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> TabulaResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn to_toml(&self) -> TabulaResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file(&self, path: &std::path::Path) -> TabulaResult<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}

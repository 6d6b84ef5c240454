//! A deterministic CPU device that records commands instead of executing them.
//!
//! Every resource it creates is a plain Rust value, so artifacts can be inspected
//! after submission. Tests use it to check barrier and staleness behaviour, and the
//! CLI falls back to it when no GPU adapter is available.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tabula_core::{
    ContextId, IdLayout, Registry, ResourceHandle, ResourceId, ResourceKind, SharedIds, TabulaError,
    TabulaResult, WorkerContext,
};

use crate::backend::{lane_center, Backend, WorkerEncoder};
use crate::scene;

pub const SUBMISSION_HISTORY: usize = 1024;

type DelayFn = Arc<dyn Fn(usize, u64) -> Duration + Send + Sync>;

/// Injected misbehaviour, read by workers through the device handle.
#[derive(Clone, Default)]
pub struct FaultPlan {
    delay: Option<DelayFn>,
    failing: Option<(usize, u64)>,
}

impl FaultPlan {
    pub fn none() -> Self {
        Self::default()
    }

    /// Sleep `delay(worker, cycle)` before encoding each frame.
    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(usize, u64) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    /// Make `worker` fail every frame encode from `from_cycle` on.
    pub fn with_failing_worker(mut self, worker: usize, from_cycle: u64) -> Self {
        self.failing = Some((worker, from_cycle));
        self
    }

    fn delay_for(&self, worker: usize, cycle: u64) -> Duration {
        self.delay
            .as_ref()
            .map(|delay| delay(worker, cycle))
            .unwrap_or(Duration::ZERO)
    }

    fn fails(&self, worker: usize, cycle: u64) -> bool {
        matches!(self.failing, Some((w, from)) if w == worker && cycle >= from)
    }
}

impl fmt::Debug for FaultPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultPlan")
            .field("delay", &self.delay.is_some())
            .field("failing", &self.failing)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Render,
    Compute,
}

#[derive(Debug)]
pub struct HeadlessPipeline {
    pub label: String,
    pub kind: PipelineKind,
}

/// A byte buffer. Writes go through [`HeadlessDevice::write_buffer`].
#[derive(Debug)]
pub struct HeadlessBuffer {
    pub label: String,
    data: Mutex<Vec<u8>>,
}

impl HeadlessBuffer {
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    /// The buffer contents as little-endian `u32` words.
    pub fn read_u32s(&self) -> Vec<u32> {
        self.data
            .lock()
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect()
    }
}

/// The view a frame's command buffers render into. A new one is published every
/// cycle in command-buffer mode.
#[derive(Debug)]
pub struct HeadlessTextureView {
    pub label: String,
    pub cycle: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrawCommand {
    BeginPass { target: String, clear: bool },
    EndPass,
    SetPipeline(String),
    SetViewport { width: u32, height: u32 },
    SetVertexBuffer { slot: u32, buffer: String },
    SetIndexBuffer(String),
    DrawIndexed { index_count: u32, instance_count: u32 },
    Dispatch { x: u32, y: u32, z: u32 },
}

/// The artifact a headless worker produces for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBundle {
    pub worker: usize,
    pub cycle: u64,
    pub commands: Vec<DrawCommand>,
}

impl RecordedBundle {
    pub fn draw_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, DrawCommand::DrawIndexed { .. }))
            .count()
    }
}

/// The artifact a headless worker produces for one frame in command-buffer mode.
///
/// Like a real command buffer it can be submitted once.
#[derive(Debug)]
pub struct RecordedCommandBuffer {
    pub worker: usize,
    pub cycle: u64,
    /// Cycle of the frame target the pass draws into.
    pub target_cycle: u64,
    pub commands: Vec<DrawCommand>,
    consumed: AtomicBool,
}

impl RecordedCommandBuffer {
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    fn consume(&self) -> TabulaResult<()> {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return Err(TabulaError::device(format!(
                "command buffer from worker {} for cycle {} was already submitted",
                self.worker, self.cycle
            )));
        }
        Ok(())
    }
}

/// One queue submission as seen by the device. Exactly one of the two lists is
/// non-empty.
#[derive(Debug, Clone)]
pub struct SubmittedBatch {
    pub cycle: u64,
    pub bundles: Vec<Arc<RecordedBundle>>,
    pub command_buffers: Vec<Arc<RecordedCommandBuffer>>,
}

#[derive(Debug)]
pub struct HeadlessDevice {
    label: String,
    faults: FaultPlan,
    submissions: Mutex<VecDeque<SubmittedBatch>>,
    submitted: AtomicU64,
    presented: AtomicU64,
    idle_waits: AtomicU64,
}

impl HeadlessDevice {
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            label: "headless-device".to_string(),
            faults,
            submissions: Mutex::new(VecDeque::new()),
            submitted: AtomicU64::new(0),
            presented: AtomicU64::new(0),
            idle_waits: AtomicU64::new(0),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn create_buffer(&self, label: &str, size: usize) -> HeadlessBuffer {
        HeadlessBuffer {
            label: label.to_string(),
            data: Mutex::new(vec![0; size]),
        }
    }

    pub fn create_buffer_init(&self, label: &str, contents: &[u8]) -> HeadlessBuffer {
        HeadlessBuffer {
            label: label.to_string(),
            data: Mutex::new(scene::padded(contents)),
        }
    }

    pub fn create_pipeline(&self, label: &str, kind: PipelineKind) -> HeadlessPipeline {
        HeadlessPipeline {
            label: label.to_string(),
            kind,
        }
    }

    /// Queue write of `words` at byte `offset`, applied immediately.
    pub fn write_buffer(&self, buffer: &HeadlessBuffer, offset: usize, words: &[u32]) -> TabulaResult<()> {
        let mut data = buffer.data.lock();
        let end = offset + words.len() * 4;
        if offset % 4 != 0 || end > data.len() {
            return Err(TabulaError::InvalidArgument(format!(
                "write of {} bytes at offset {} does not fit buffer '{}' ({} bytes)",
                words.len() * 4,
                offset,
                buffer.label,
                data.len()
            )));
        }
        data[offset..end].copy_from_slice(bytemuck::cast_slice(words));
        Ok(())
    }

    /// The most recent submissions, oldest first. At most [`SUBMISSION_HISTORY`] are kept.
    pub fn submissions(&self) -> Vec<SubmittedBatch> {
        self.submissions.lock().iter().cloned().collect()
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.load(Ordering::Relaxed) as usize
    }

    fn record_submission(&self, batch: SubmittedBatch) {
        let mut history = self.submissions.lock();
        if history.len() == SUBMISSION_HISTORY {
            history.pop_front();
        }
        history.push_back(batch);
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    pub fn idle_waits(&self) -> u64 {
        self.idle_waits.load(Ordering::Relaxed)
    }
}

pub struct HeadlessBackend {
    device: Arc<HeadlessDevice>,
    width: u32,
    height: u32,
}

impl HeadlessBackend {
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            device: Arc::new(HeadlessDevice::new(faults)),
            width: 640,
            height: 640,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn device(&self) -> Arc<HeadlessDevice> {
        Arc::clone(&self.device)
    }

    fn device_handle(&self) -> ResourceHandle {
        ResourceHandle::from_arc(ResourceKind::Device, Arc::clone(&self.device)).with_label("headless-device")
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(FaultPlan::none())
    }
}

/// Publish `handle` at `id`, tolerating a previous publish of the same resource.
pub(crate) fn publish_once(registry: &Registry, id: ResourceId, handle: ResourceHandle) -> TabulaResult<()> {
    match registry.publish(id, handle.clone()) {
        Ok(_) => Ok(()),
        Err(TabulaError::AlreadyPublished { .. })
            if registry.get(id).is_ok_and(|existing| existing.ptr_eq(&handle)) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

impl Backend for HeadlessBackend {
    type Encoder = HeadlessEncoder;

    fn name(&self) -> &'static str {
        "headless"
    }

    fn publish_device(&mut self, registry: &Registry, id: ResourceId) -> TabulaResult<()> {
        publish_once(registry, id, self.device_handle())
    }

    fn publish_scene(
        &mut self,
        registry: &Registry,
        ids: &IdLayout,
        workers: usize,
    ) -> TabulaResult<Vec<SharedIds>> {
        self.publish_device(registry, ids.device)?;

        let pipeline = self.device.create_pipeline("triangle-pipeline", PipelineKind::Render);
        registry.publish(ids.pipeline, ResourceHandle::new(ResourceKind::Pipeline, pipeline))?;

        let colors = self
            .device
            .create_buffer_init("color-buffer", bytemuck::cast_slice(&scene::COLORS));
        registry.publish(ids.color_buffer, ResourceHandle::new(ResourceKind::Buffer, colors))?;

        let indices = self
            .device
            .create_buffer_init("index-buffer", bytemuck::cast_slice(&scene::INDICES));
        registry.publish(ids.index_buffer, ResourceHandle::new(ResourceKind::Buffer, indices))?;

        let mut shared = Vec::with_capacity(workers);
        for worker in 0..workers {
            let positions = scene::triangle_positions(lane_center(worker, workers));
            let buffer = self.device.create_buffer_init(
                &format!("position-buffer-{}", worker),
                bytemuck::cast_slice(&positions),
            );
            let position_id = ids.position_id(worker)?;
            registry.publish(position_id, ResourceHandle::new(ResourceKind::Buffer, buffer))?;

            shared.push(SharedIds {
                device: ids.device,
                pipeline: Some(ids.pipeline),
                vertex_buffers: vec![position_id, ids.color_buffer],
                index_buffer: Some(ids.index_buffer),
            });
        }

        tracing::info!(
            "headless scene published: {} workers, {} registry entries ({}x{})",
            workers,
            registry.len(),
            self.width,
            self.height
        );
        Ok(shared)
    }

    fn publish_frame_target(
        &mut self,
        registry: &Registry,
        id: ResourceId,
        cycle: u64,
    ) -> TabulaResult<()> {
        let view = HeadlessTextureView {
            label: format!("frame-target-c{}", cycle),
            cycle,
            width: self.width,
            height: self.height,
        };
        let label = view.label.clone();
        registry.insert_as(
            ContextId::Orchestrator,
            id,
            ResourceHandle::new(ResourceKind::TextureView, view).with_label(label),
        )?;
        Ok(())
    }

    fn submit(&mut self, cycle: u64, batch: &[ResourceHandle]) -> TabulaResult<()> {
        let mut bundles = Vec::new();
        let mut command_buffers = Vec::new();
        for handle in batch {
            if let Some(bundle) = handle.downcast::<RecordedBundle>() {
                bundles.push(bundle);
            } else if let Some(commands) = handle.downcast::<RecordedCommandBuffer>() {
                command_buffers.push(commands);
            } else {
                return Err(TabulaError::device(format!(
                    "cannot execute {} ({}) on the headless queue",
                    handle.kind(),
                    handle.type_name()
                )));
            }
        }
        if !bundles.is_empty() && !command_buffers.is_empty() {
            return Err(TabulaError::device(
                "a submission cannot mix render bundles and command buffers",
            ));
        }
        for commands in &command_buffers {
            commands.consume()?;
        }

        tracing::trace!(
            "headless submit: cycle {} with {} bundles, {} command buffers",
            cycle,
            bundles.len(),
            command_buffers.len()
        );
        self.device.record_submission(SubmittedBatch {
            cycle,
            bundles,
            command_buffers,
        });
        Ok(())
    }

    fn present(&mut self) -> TabulaResult<()> {
        self.device.presented.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_idle(&mut self) -> TabulaResult<()> {
        self.device.idle_waits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct HeadlessEncoder {
    worker: usize,
    width: u32,
    height: u32,
    device: Arc<HeadlessDevice>,
    pipeline: Option<Arc<HeadlessPipeline>>,
    vertex_buffers: Vec<Arc<HeadlessBuffer>>,
    index_buffer: Option<Arc<HeadlessBuffer>>,
    compute: Option<HeadlessPipeline>,
}

impl HeadlessEncoder {
    fn draw_commands(&self) -> TabulaResult<Vec<DrawCommand>> {
        let pipeline = self
            .pipeline
            .as_ref()
            .ok_or_else(|| TabulaError::InvalidArgument("no render pipeline bound".into()))?;

        let mut commands = vec![
            DrawCommand::SetPipeline(pipeline.label.clone()),
            DrawCommand::SetViewport {
                width: self.width,
                height: self.height,
            },
        ];
        for (slot, buffer) in self.vertex_buffers.iter().enumerate() {
            commands.push(DrawCommand::SetVertexBuffer {
                slot: slot as u32,
                buffer: buffer.label.clone(),
            });
        }
        if let Some(index) = &self.index_buffer {
            commands.push(DrawCommand::SetIndexBuffer(index.label.clone()));
            commands.push(DrawCommand::DrawIndexed {
                index_count: scene::INDICES.len() as u32,
                instance_count: 1,
            });
        }
        Ok(commands)
    }
}

impl WorkerEncoder for HeadlessEncoder {
    fn bind(ctx: &WorkerContext, registry: &Registry) -> TabulaResult<Self> {
        let context = ContextId::worker(ctx.index);
        let device = registry.resolve_as::<HeadlessDevice>(context, ctx.shared.device)?;
        let pipeline = ctx
            .shared
            .pipeline
            .map(|id| registry.resolve_as::<HeadlessPipeline>(context, id))
            .transpose()?;
        let vertex_buffers = ctx
            .shared
            .vertex_buffers
            .iter()
            .map(|id| registry.resolve_as::<HeadlessBuffer>(context, *id))
            .collect::<TabulaResult<Vec<_>>>()?;
        let index_buffer = ctx
            .shared
            .index_buffer
            .map(|id| registry.resolve_as::<HeadlessBuffer>(context, id))
            .transpose()?;

        Ok(Self {
            worker: ctx.index,
            width: ctx.width,
            height: ctx.height,
            device,
            pipeline,
            vertex_buffers,
            index_buffer,
            compute: None,
        })
    }

    fn encode_frame(
        &mut self,
        cycle: u64,
        target: Option<&ResourceHandle>,
    ) -> TabulaResult<ResourceHandle> {
        let delay = self.device.faults.delay_for(self.worker, cycle);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.device.faults.fails(self.worker, cycle) {
            return Err(TabulaError::device(format!(
                "injected encode failure on worker {} in cycle {}",
                self.worker, cycle
            )));
        }

        match target {
            None => {
                let bundle = RecordedBundle {
                    worker: self.worker,
                    cycle,
                    commands: self.draw_commands()?,
                };
                Ok(ResourceHandle::new(ResourceKind::RenderBundle, bundle)
                    .with_label(format!("bundle-w{}-c{}", self.worker, cycle)))
            }
            Some(target) => {
                let view = target.downcast::<HeadlessTextureView>().ok_or_else(|| {
                    TabulaError::device(format!("{} is not a texture view", target.type_name()))
                })?;
                // The first worker clears the target, later passes draw over it.
                let mut commands = vec![DrawCommand::BeginPass {
                    target: view.label.clone(),
                    clear: self.worker == 0,
                }];
                commands.extend(self.draw_commands()?);
                commands.push(DrawCommand::EndPass);

                let recorded = RecordedCommandBuffer {
                    worker: self.worker,
                    cycle,
                    target_cycle: view.cycle,
                    commands,
                    consumed: AtomicBool::new(false),
                };
                Ok(ResourceHandle::new(ResourceKind::CommandBuffer, recorded)
                    .with_label(format!("commands-w{}-c{}", self.worker, cycle)))
            }
        }
    }

    fn encode_workload(&mut self, dispatch_count: u32) -> TabulaResult<()> {
        let device = &self.device;
        let pipeline = self
            .compute
            .get_or_insert_with(|| device.create_pipeline("bench-compute", PipelineKind::Compute));

        let (x, y, z) = scene::WORKLOAD_DISPATCH;
        let mut commands = Vec::with_capacity(dispatch_count as usize + 1);
        commands.push(DrawCommand::SetPipeline(pipeline.label.clone()));
        for _ in 0..dispatch_count {
            commands.push(DrawCommand::Dispatch { x, y, z });
        }
        std::hint::black_box(&commands);
        Ok(())
    }
}

//! The seam between the coordination layer and a device API.
//!
//! The device is an external collaborator. The coordinator only ever asks it to
//! create shared resources, encode work into a new resource, and submit resources to
//! a queue. Everything else (adapters, shaders, descriptors) stays behind these traits.

use tabula_core::{IdLayout, Registry, ResourceHandle, ResourceId, SharedIds, TabulaResult, WorkerContext};

/// Worker-side encoding state.
///
/// Built once on the worker's own thread from the registry, after which the worker
/// never resolves shared handles again.
pub trait WorkerEncoder: Sized + Send + 'static {
    /// Resolve and cache the shared handles named in `ctx`.
    fn bind(ctx: &WorkerContext, registry: &Registry) -> TabulaResult<Self>;

    /// Encode exactly one artifact for frame `cycle`.
    ///
    /// Without a `target` the artifact is a render bundle. With one, it is a finished
    /// command buffer whose render pass draws into that frame target.
    fn encode_frame(
        &mut self,
        cycle: u64,
        target: Option<&ResourceHandle>,
    ) -> TabulaResult<ResourceHandle>;

    /// Record `dispatch_count` compute dispatches into a single pass and finish it.
    fn encode_workload(&mut self, dispatch_count: u32) -> TabulaResult<()>;
}

/// Orchestrator-side device access.
pub trait Backend {
    type Encoder: WorkerEncoder;

    fn name(&self) -> &'static str;

    /// Publish the device handle alone. Used by benchmark runs.
    fn publish_device(&mut self, registry: &Registry, id: ResourceId) -> TabulaResult<()>;

    /// Publish the device, pipeline and buffers used for frame encoding.
    /// Returns the shared ids for each of `workers` workers.
    fn publish_scene(
        &mut self,
        registry: &Registry,
        ids: &IdLayout,
        workers: usize,
    ) -> TabulaResult<Vec<SharedIds>>;

    /// Create the render target view for frame `cycle` and write it at `id`, which
    /// the orchestrator has claimed. Used in command-buffer mode.
    fn publish_frame_target(
        &mut self,
        registry: &Registry,
        id: ResourceId,
        cycle: u64,
    ) -> TabulaResult<()>;

    /// Submit one frame's artifacts, in worker order, as a single queue submission.
    /// A batch holds either render bundles or command buffers, never both.
    fn submit(&mut self, cycle: u64, batch: &[ResourceHandle]) -> TabulaResult<()>;

    /// Show the frame that was just submitted.
    fn present(&mut self) -> TabulaResult<()>;

    /// Block until all submitted work has completed on the device.
    fn wait_idle(&mut self) -> TabulaResult<()>;
}

/// Horizontal centre of worker `index`'s triangle when `workers` triangles share the
/// viewport. Two workers give -0.5 and +0.5.
pub fn lane_center(index: usize, workers: usize) -> f32 {
    let workers = workers.max(1) as f32;
    -1.0 + (2.0 * index as f32 + 1.0) / workers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_centers_for_two_workers() {
        assert!((lane_center(0, 2) + 0.5).abs() < f32::EPSILON);
        assert!((lane_center(1, 2) - 0.5).abs() < f32::EPSILON);
        assert!(lane_center(0, 1).abs() < f32::EPSILON);
    }
}

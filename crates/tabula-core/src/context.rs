//! What a worker knows about itself after initialization.

use crate::handle::ResourceId;

/// Registry ids of the shared read-only resources a worker binds to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedIds {
    pub device: ResourceId,
    /// Absent for workers that build their own pipeline (benchmark workloads).
    pub pipeline: Option<ResourceId>,
    pub vertex_buffers: Vec<ResourceId>,
    pub index_buffer: Option<ResourceId>,
}

impl SharedIds {
    pub fn device_only(device: ResourceId) -> Self {
        Self {
            device,
            pipeline: None,
            vertex_buffers: Vec::new(),
            index_buffer: None,
        }
    }

    /// Every id in binding order: device, pipeline, vertex buffers, index buffer.
    pub fn all(&self) -> Vec<ResourceId> {
        let mut ids = vec![self.device];
        ids.extend(self.pipeline);
        ids.extend(self.vertex_buffers.iter().copied());
        ids.extend(self.index_buffer);
        ids
    }
}

/// Immutable per-worker state built from the init message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    pub index: usize,
    pub output_id: ResourceId,
    pub shared: SharedIds,
    /// Where the orchestrator publishes each frame's render target, in command-buffer
    /// mode. Resolved per encode, never cached.
    pub frame_target: Option<ResourceId>,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_ids_binding_order() {
        let shared = SharedIds {
            device: ResourceId::new(1),
            pipeline: Some(ResourceId::new(2)),
            vertex_buffers: vec![ResourceId::new(4), ResourceId::new(5)],
            index_buffer: None,
        };
        let ids: Vec<u32> = shared.all().into_iter().map(ResourceId::get).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);
        assert_eq!(SharedIds::device_only(ResourceId::new(1)).all().len(), 1);
    }
}

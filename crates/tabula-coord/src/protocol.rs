//! Messages between the orchestrator and its workers.
//!
//! Every message a worker receives, other than [`WorkerMessage::Shutdown`], is
//! answered with exactly one [`Completion`]. Completions carry the cycle or trial
//! they answer so the orchestrator can discard replies that arrive late.

use std::sync::Arc;
use std::time::Duration;

use tabula_core::{
    ContextId, Registry, ResourceId, SharedIds, TabulaError, TabulaResult, WorkerContext,
};

/// One-time setup for a worker.
#[derive(Debug, Clone)]
pub struct InitMessage {
    pub index: usize,
    pub output_id: ResourceId,
    pub shared: SharedIds,
    /// Set in command-buffer mode. The target itself is published per frame.
    pub frame_target: Option<ResourceId>,
    pub width: u32,
    pub height: u32,
    pub registry: Arc<Registry>,
}

impl InitMessage {
    pub fn context(&self) -> WorkerContext {
        WorkerContext {
            index: self.index,
            output_id: self.output_id,
            shared: self.shared.clone(),
            frame_target: self.frame_target,
            width: self.width,
            height: self.height,
        }
    }

    /// Check that every shared handle may cross into the target worker and wrap the
    /// message for sending.
    ///
    /// On failure the caller sends [`WorkerMessage::Unavailable`] instead.
    pub fn pack(self) -> TabulaResult<WorkerMessage> {
        let target = ContextId::worker(self.index);
        for id in self.shared.all() {
            self.registry.get(id)?.transfer_to(target)?;
        }
        Ok(WorkerMessage::Init(self))
    }
}

#[derive(Debug)]
pub enum WorkerMessage {
    Init(InitMessage),
    /// Encode this worker's artifact for frame `cycle`.
    Encode { cycle: u64 },
    /// Benchmark trial: record `dispatch_count` dispatches.
    Workload { trial: u64, dispatch_count: u32 },
    /// Sent in place of a payload that could not be transferred.
    Unavailable,
    Shutdown,
}

impl WorkerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerMessage::Init(_) => "init",
            WorkerMessage::Encode { .. } => "encode",
            WorkerMessage::Workload { .. } => "workload",
            WorkerMessage::Unavailable => "unavailable",
            WorkerMessage::Shutdown => "shutdown",
        }
    }
}

/// Which request a completion answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Init,
    Frame(u64),
    Trial(u64),
    Unavailable,
}

#[derive(Debug)]
pub struct Completion {
    pub worker: usize,
    pub signal: Signal,
    /// Time spent inside the encoder, for frame and trial requests.
    pub elapsed: Option<Duration>,
    /// `Ok(Some(generation))` when a frame artifact was written to the registry.
    pub outcome: TabulaResult<Option<u64>>,
}

impl Completion {
    pub fn ok(worker: usize, signal: Signal) -> Self {
        Self {
            worker,
            signal,
            elapsed: None,
            outcome: Ok(None),
        }
    }

    pub fn failed(worker: usize, signal: Signal, error: TabulaError) -> Self {
        Self {
            worker,
            signal,
            elapsed: None,
            outcome: Err(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Registry generation of the artifact this completion reports, if any.
    pub fn generation(&self) -> Option<u64> {
        self.outcome.as_ref().ok().copied().flatten()
    }
}

/// Payload-or-sentinel wrapper for one-shot deliveries outside the worker loop.
#[derive(Debug)]
pub enum Delivery<T> {
    Payload(T),
    Unavailable,
}

impl<T> Delivery<T> {
    /// Wrap the result of preparing a payload, substituting the sentinel on failure.
    pub fn or_unavailable(prepared: TabulaResult<T>) -> (Self, Option<TabulaError>) {
        match prepared {
            Ok(payload) => (Delivery::Payload(payload), None),
            Err(e) => {
                tracing::warn!("payload not transferable, sending sentinel: {}", e);
                (Delivery::Unavailable, Some(e))
            }
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Delivery::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabula_core::{ResourceHandle, ResourceKind};

    fn init(registry: Arc<Registry>) -> InitMessage {
        InitMessage {
            index: 0,
            output_id: ResourceId::new(10),
            shared: SharedIds::device_only(ResourceId::new(1)),
            frame_target: None,
            width: 64,
            height: 64,
            registry,
        }
    }

    #[test]
    fn test_pack_shared_handles() {
        let registry = Registry::shared();
        registry
            .publish(ResourceId::new(1), ResourceHandle::new(ResourceKind::Device, 0u8))
            .unwrap();
        let message = init(registry).pack().unwrap();
        assert_eq!(message.name(), "init");
    }

    #[test]
    fn test_pack_rejects_pinned_device() {
        let registry = Registry::shared();
        registry
            .publish(
                ResourceId::new(1),
                ResourceHandle::new(ResourceKind::Device, 0u8).pinned_to(ContextId::Orchestrator),
            )
            .unwrap();
        assert!(matches!(init(registry).pack(), Err(TabulaError::Transfer(_))));
    }

    #[test]
    fn test_pack_rejects_missing_resource() {
        let err = init(Registry::shared()).pack().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_completion_generation() {
        let mut done = Completion::ok(1, Signal::Frame(3));
        assert_eq!(done.generation(), None);
        done.outcome = Ok(Some(42));
        assert_eq!(done.generation(), Some(42));
        let failed = Completion::failed(1, Signal::Frame(3), TabulaError::ChannelClosed);
        assert!(!failed.is_ok());
        assert_eq!(failed.generation(), None);
    }

    #[test]
    fn test_delivery_falls_back_to_sentinel() {
        let (delivery, error) = Delivery::<u32>::or_unavailable(Err(TabulaError::Transfer("pinned".into())));
        assert!(delivery.is_unavailable());
        assert!(error.is_some());
        let (delivery, error) = Delivery::or_unavailable(Ok(5u32));
        assert!(matches!(delivery, Delivery::Payload(5)));
        assert!(error.is_none());
    }
}

//! Cross-context transfer probe.
//!
//! The orchestrator creates a device and an 8-byte buffer and tries to hand both to a
//! worker. Whether or not that succeeds, the orchestrator writes
//! [`ORCHESTRATOR_WORD`] at byte offset 4. A worker that received the resources
//! writes [`WORKER_WORD`] at offset 0. Either way the worker acknowledges, and the
//! orchestrator reads the buffer back: `[33333, 77777]` when the transfer worked,
//! `[0, 77777]` when the sentinel was sent instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use tabula_core::{
    ContextId, Registry, ResourceHandle, ResourceId, ResourceKind, TabulaError, TabulaResult,
};
use tabula_gpu::{FaultPlan, HeadlessBuffer, HeadlessDevice};

use crate::protocol::Delivery;

pub const WORKER_WORD: u32 = 33333;
pub const ORCHESTRATOR_WORD: u32 = 77777;

const PROBE_WORKER: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeMode {
    /// Send the handles themselves.
    Direct,
    /// Publish the handles and send only the registry and their ids.
    Registry,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeOptions {
    pub mode: ProbeMode,
    /// Pin the device to the orchestrator so the transfer fails.
    pub pin_device: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub mode: ProbeMode,
    pub transferred: bool,
    pub readback: Vec<u32>,
    /// Ids the device and buffer were published under, in registry mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registry_ids: Vec<ResourceId>,
}

enum ProbeTarget {
    Handles {
        device: ResourceHandle,
        buffer: ResourceHandle,
    },
    Table {
        registry: Arc<Registry>,
        device: ResourceId,
        buffer: ResourceId,
    },
}

impl ProbeTarget {
    fn registry_ids(&self) -> Vec<ResourceId> {
        match self {
            ProbeTarget::Handles { .. } => Vec::new(),
            ProbeTarget::Table { device, buffer, .. } => vec![*device, *buffer],
        }
    }
}

fn write_from_worker(target: ProbeTarget) -> TabulaResult<()> {
    let (device, buffer) = match target {
        ProbeTarget::Handles { device, buffer } => (
            device
                .downcast::<HeadlessDevice>()
                .ok_or_else(|| TabulaError::Transfer("device payload is not a device".into()))?,
            buffer
                .downcast::<HeadlessBuffer>()
                .ok_or_else(|| TabulaError::Transfer("buffer payload is not a buffer".into()))?,
        ),
        ProbeTarget::Table {
            registry,
            device,
            buffer,
        } => {
            let context = ContextId::worker(PROBE_WORKER);
            (
                registry.resolve_as::<HeadlessDevice>(context, device)?,
                registry.resolve_as::<HeadlessBuffer>(context, buffer)?,
            )
        }
    };
    device.write_buffer(&buffer, 0, &[WORKER_WORD])
}

fn prepare(
    mode: ProbeMode,
    registry: Arc<Registry>,
    device: ResourceHandle,
    buffer: ResourceHandle,
) -> TabulaResult<ProbeTarget> {
    let target = ContextId::worker(PROBE_WORKER);
    match mode {
        ProbeMode::Direct => Ok(ProbeTarget::Handles {
            device: device.transfer_to(target)?,
            buffer: buffer.transfer_to(target)?,
        }),
        ProbeMode::Registry => {
            let device = registry.publish_new(device);
            let buffer = registry.publish_new(buffer);
            for id in [device, buffer] {
                registry.get(id)?.transfer_to(target)?;
            }
            Ok(ProbeTarget::Table {
                registry,
                device,
                buffer,
            })
        }
    }
}

/// Run the probe against a fresh registry.
pub async fn run_probe(options: ProbeOptions) -> TabulaResult<ProbeReport> {
    run_probe_in(options, Registry::shared()).await
}

/// Run the probe, publishing into `registry` in registry mode. Entries already in
/// `registry` are left untouched.
pub async fn run_probe_in(
    options: ProbeOptions,
    registry: Arc<Registry>,
) -> TabulaResult<ProbeReport> {
    let (request_tx, request_rx) = oneshot::channel::<Delivery<ProbeTarget>>();
    let (done_tx, done_rx) = oneshot::channel::<TabulaResult<()>>();

    let worker = std::thread::Builder::new()
        .name("tabula-probe".into())
        .spawn(move || {
            let Ok(delivery) = request_rx.blocking_recv() else {
                return;
            };
            let result = match delivery {
                Delivery::Payload(target) => write_from_worker(target),
                Delivery::Unavailable => Ok(()),
            };
            let _ = done_tx.send(result);
        })?;

    let device = Arc::new(HeadlessDevice::new(FaultPlan::none()));
    let buffer = Arc::new(device.create_buffer("probe-buffer", 8));

    let mut device_handle =
        ResourceHandle::from_arc(ResourceKind::Device, Arc::clone(&device)).with_label("probe-device");
    if options.pin_device {
        device_handle = device_handle.pinned_to(ContextId::Orchestrator);
    }
    let buffer_handle =
        ResourceHandle::from_arc(ResourceKind::Buffer, Arc::clone(&buffer)).with_label("probe-buffer");

    let prepared = prepare(options.mode, registry, device_handle, buffer_handle);
    let registry_ids = prepared
        .as_ref()
        .map(ProbeTarget::registry_ids)
        .unwrap_or_default();
    let (delivery, failure) = Delivery::or_unavailable(prepared);
    let transferred = failure.is_none();
    let sent = request_tx.send(delivery).is_ok();

    // Written whether or not the transfer succeeded.
    device.write_buffer(&buffer, 4, &[ORCHESTRATOR_WORD])?;

    if !sent {
        return Err(TabulaError::ChannelClosed);
    }
    let reply = done_rx.await.map_err(|_| TabulaError::ChannelClosed)?;
    if worker.join().is_err() {
        return Err(TabulaError::worker(PROBE_WORKER, "probe thread panicked"));
    }
    reply?;

    let readback = buffer.read_u32s();
    tracing::info!(
        "transfer probe ({:?}): transferred={}, readback={:?}",
        options.mode,
        transferred,
        readback
    );
    Ok(ProbeReport {
        mode: options.mode,
        transferred,
        readback,
        registry_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_transfer_writes_both_words() {
        let report = run_probe(ProbeOptions {
            mode: ProbeMode::Direct,
            pin_device: false,
        })
        .await
        .unwrap();
        assert!(report.transferred);
        assert_eq!(report.readback, vec![WORKER_WORD, ORCHESTRATOR_WORD]);
    }

    #[tokio::test]
    async fn test_pinned_device_falls_back_to_sentinel() {
        let report = run_probe(ProbeOptions {
            mode: ProbeMode::Direct,
            pin_device: true,
        })
        .await
        .unwrap();
        assert!(!report.transferred);
        assert_eq!(report.readback, vec![0, ORCHESTRATOR_WORD]);
    }

    #[tokio::test]
    async fn test_registry_path_matches_direct_path() {
        for pin_device in [false, true] {
            let direct = run_probe(ProbeOptions {
                mode: ProbeMode::Direct,
                pin_device,
            })
            .await
            .unwrap();
            let table = run_probe(ProbeOptions {
                mode: ProbeMode::Registry,
                pin_device,
            })
            .await
            .unwrap();
            assert_eq!(direct.transferred, table.transferred);
            assert_eq!(direct.readback, table.readback);
            assert!(direct.registry_ids.is_empty());
        }
    }

    #[tokio::test]
    async fn test_registry_mode_leaves_existing_entries_alone() {
        let registry = Registry::shared();
        let first = ResourceHandle::new(ResourceKind::Buffer, 1u32);
        let second = ResourceHandle::new(ResourceKind::Buffer, 2u32);
        registry.insert(ResourceId::new(1), first.clone());
        registry.insert(ResourceId::new(2), second.clone());

        let report = run_probe_in(
            ProbeOptions {
                mode: ProbeMode::Registry,
                pin_device: false,
            },
            Arc::clone(&registry),
        )
        .await
        .unwrap();

        assert!(report.transferred);
        assert_eq!(report.readback, vec![WORKER_WORD, ORCHESTRATOR_WORD]);
        assert_eq!(report.registry_ids, vec![ResourceId::new(3), ResourceId::new(4)]);
        assert!(registry.get(ResourceId::new(1)).unwrap().ptr_eq(&first));
        assert!(registry.get(ResourceId::new(2)).unwrap().ptr_eq(&second));
        assert_eq!(
            registry.get(ResourceId::new(3)).unwrap().kind(),
            ResourceKind::Device
        );
    }
}

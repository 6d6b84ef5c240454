//! # tabula-gpu
//!
//! Device backends for Tabula. The coordination layer talks to a device only through
//! [`Backend`] (orchestrator side) and [`WorkerEncoder`] (worker side).
//! [`HeadlessBackend`] records commands on the CPU; [`WgpuBackend`] drives a real GPU.
//! Both produce either render bundles or whole command buffers per frame.

pub mod backend;
pub mod gpu;
pub mod headless;
pub mod scene;
pub mod wgpu_backend;

pub use backend::{Backend, WorkerEncoder};
pub use gpu::{GpuContext, FRAME_FORMAT};
pub use headless::{
    FaultPlan, HeadlessBackend, HeadlessBuffer, HeadlessDevice, HeadlessEncoder, HeadlessTextureView,
    RecordedBundle, RecordedCommandBuffer, SubmittedBatch,
};
pub use wgpu_backend::{EncodedCommands, WgpuBackend, WgpuEncoder};

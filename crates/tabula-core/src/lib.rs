//! # tabula-core
//!
//! Core types for Tabula: the error type, configuration, resource and context
//! identifiers, opaque resource handles, and the cross-context handle registry.

pub mod config;
pub mod context;
pub mod error;
pub mod handle;
pub mod registry;

pub use config::*;

pub use context::{SharedIds, WorkerContext};
pub use error::{TabulaError, TabulaResult};
pub use handle::{Affinity, ContextId, ResourceHandle, ResourceId, ResourceKind};
pub use registry::{Registry, RegistryEntry};

//! Resource identifiers, execution-context identifiers and opaque resource handles.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{TabulaError, TabulaResult};

/// A small integer key into the [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub u32);

impl ResourceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The id `n` slots after this one, or `None` past `u32::MAX`. Used to lay out
    /// per-worker ranges.
    pub fn offset(self, n: usize) -> Option<Self> {
        let n = u32::try_from(n).ok()?;
        self.0.checked_add(n).map(Self)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u32> for ResourceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// An execution context: the orchestrator or one of the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextId {
    Orchestrator,
    Worker(usize),
}

impl ContextId {
    pub fn worker(index: usize) -> Self {
        ContextId::Worker(index)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextId::Orchestrator => write!(f, "orchestrator"),
            ContextId::Worker(i) => write!(f, "worker-{}", i),
        }
    }
}

/// What a handle refers to. Informational only; typed access goes through
/// [`ResourceHandle::downcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Device,
    Buffer,
    Pipeline,
    CommandBuffer,
    RenderBundle,
    TextureView,
    Other,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Device => "device",
            ResourceKind::Buffer => "buffer",
            ResourceKind::Pipeline => "pipeline",
            ResourceKind::CommandBuffer => "command buffer",
            ResourceKind::RenderBundle => "render bundle",
            ResourceKind::TextureView => "texture view",
            ResourceKind::Other => "resource",
        };
        f.write_str(name)
    }
}

/// Whether a handle may be referenced from a context other than the one that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Affinity {
    #[default]
    Shared,
    /// Bound to the creating context. Transfer attempts fail.
    Pinned(ContextId),
}

/// An opaque capability referring to a device-side resource.
///
/// Cloning a handle clones the reference, never the resource. Two handles are the
/// same capability when [`ResourceHandle::ptr_eq`] holds.
#[derive(Clone)]
pub struct ResourceHandle {
    kind: ResourceKind,
    label: Option<Arc<str>>,
    affinity: Affinity,
    type_name: &'static str,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ResourceHandle {
    /// Wrap a freshly created resource.
    pub fn new<T: Any + Send + Sync>(kind: ResourceKind, value: T) -> Self {
        Self::from_arc(kind, Arc::new(value))
    }

    /// Wrap a resource that is already reference counted by its owner.
    pub fn from_arc<T: Any + Send + Sync>(kind: ResourceKind, value: Arc<T>) -> Self {
        Self {
            kind,
            label: None,
            affinity: Affinity::Shared,
            type_name: std::any::type_name::<T>(),
            inner: value,
        }
    }

    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Bind the handle to `context`; it can no longer be transferred elsewhere.
    pub fn pinned_to(mut self, context: ContextId) -> Self {
        self.affinity = Affinity::Pinned(context);
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    /// Rust type name of the wrapped resource.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Typed view of the resource, or `None` if it is of another type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn is<T: Any + Send + Sync>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// True when both handles refer to the same underlying resource.
    pub fn ptr_eq(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Produce the reference `target` receives, or fail if the handle is pinned elsewhere.
    pub fn transfer_to(&self, target: ContextId) -> TabulaResult<ResourceHandle> {
        match self.affinity {
            Affinity::Pinned(owner) if owner != target => Err(TabulaError::Transfer(format!(
                "{} {} is pinned to {} and cannot be sent to {}",
                self.kind,
                self.label().unwrap_or("<unlabeled>"),
                owner,
                target
            ))),
            _ => Ok(self.clone()),
        }
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("affinity", &self.affinity)
            .field("type", &self.type_name)
            .finish()
    }
}

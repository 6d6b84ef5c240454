//! The handle registry: a shared directory from [`ResourceId`] to [`ResourceHandle`].
//!
//! One registry is created by the orchestrator and handed to every worker as an
//! `Arc<Registry>`. The arena is the only thing that crosses a context boundary;
//! resources themselves are never copied or serialized.
//!
//! Two write paths exist. [`Registry::insert`] is the bare directory operation and
//! overwrites unconditionally. [`Registry::publish`], [`Registry::claim`] and
//! [`Registry::insert_as`] add runtime checks for the single-writer discipline:
//! sealed entries reject writes, claimed ids reject writes from other contexts.

use std::any::Any;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{TabulaError, TabulaResult};
use crate::handle::{ContextId, ResourceHandle, ResourceId};

#[derive(Debug, Clone)]
struct Slot {
    handle: ResourceHandle,
    generation: u64,
    sealed: bool,
}

/// A handle together with the generation of the write that stored it.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub handle: ResourceHandle,
    /// Registry-wide write stamp. Strictly increasing across all writes.
    pub generation: u64,
    pub sealed: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<ResourceId, Slot>,
    owners: DashMap<ResourceId, ContextId>,
    next_generation: AtomicU64,
    next_id: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for the common `Arc::new(Registry::new())`.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn stamp(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Store or overwrite the mapping for `id`. Returns the generation of this write.
    ///
    /// The previous reference, if any, is dropped. Callers must not overwrite an entry
    /// another context is still reading in the current cycle.
    pub fn insert(&self, id: ResourceId, handle: ResourceHandle) -> u64 {
        let generation = self.stamp();
        let previous = self.entries.insert(
            id,
            Slot {
                handle,
                generation,
                sealed: false,
            },
        );
        if previous.as_ref().is_some_and(|slot| slot.sealed) {
            tracing::warn!("unchecked insert overwrote sealed resource {}", id);
        }
        generation
    }

    /// Store `handle` under a fresh id and return that id.
    ///
    /// Allocated ids count up from 1 and skip ids that are present, so a live entry
    /// is never replaced.
    pub fn insert_new(&self, handle: ResourceHandle) -> ResourceId {
        self.allocate(handle, false)
    }

    /// [`Registry::insert_new`] for a read-only entry: the new entry is sealed.
    pub fn publish_new(&self, handle: ResourceHandle) -> ResourceId {
        self.allocate(handle, true)
    }

    fn allocate(&self, handle: ResourceHandle, sealed: bool) -> ResourceId {
        loop {
            let id = ResourceId::new(self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1));
            if let Entry::Vacant(vacant) = self.entries.entry(id) {
                let generation = self.stamp();
                tracing::trace!("allocated {} ({}) at generation {}", id, handle.kind(), generation);
                vacant.insert(Slot {
                    handle,
                    generation,
                    sealed,
                });
                return id;
            }
        }
    }

    /// The handle currently stored for `id`.
    pub fn get(&self, id: ResourceId) -> TabulaResult<ResourceHandle> {
        self.entries
            .get(&id)
            .map(|slot| slot.handle.clone())
            .ok_or(TabulaError::NotFound { id })
    }

    /// The handle and write generation currently stored for `id`.
    pub fn lookup(&self, id: ResourceId) -> TabulaResult<RegistryEntry> {
        self.entries
            .get(&id)
            .map(|slot| RegistryEntry {
                handle: slot.handle.clone(),
                generation: slot.generation,
                sealed: slot.sealed,
            })
            .ok_or(TabulaError::NotFound { id })
    }

    /// Resolve `id` and view it as a `T`.
    pub fn get_as<T: Any + Send + Sync>(&self, id: ResourceId) -> TabulaResult<Arc<T>> {
        typed(id, self.get(id)?)
    }

    /// Typed resolution on behalf of `context`. Handles pinned to another context
    /// fail with a transfer error.
    pub fn resolve_as<T: Any + Send + Sync>(
        &self,
        context: ContextId,
        id: ResourceId,
    ) -> TabulaResult<Arc<T>> {
        typed(id, self.get(id)?.transfer_to(context)?)
    }

    /// Delete the mapping for `id`, returning the removed handle.
    pub fn remove(&self, id: ResourceId) -> Option<ResourceHandle> {
        self.entries.remove(&id).map(|(_, slot)| slot.handle)
    }

    /// Write a read-only entry exactly once. Later checked writes to `id` fail.
    pub fn publish(&self, id: ResourceId, handle: ResourceHandle) -> TabulaResult<u64> {
        match self.entries.entry(id) {
            Entry::Occupied(_) => Err(TabulaError::AlreadyPublished { id }),
            Entry::Vacant(vacant) => {
                let generation = self.stamp();
                tracing::trace!("published {} ({}) at generation {}", id, handle.kind(), generation);
                vacant.insert(Slot {
                    handle,
                    generation,
                    sealed: true,
                });
                Ok(generation)
            }
        }
    }

    /// Reserve `id` for a single writer. Claiming an id already held by `owner` is a
    /// no-op. Sealed ids cannot be claimed.
    pub fn claim(&self, id: ResourceId, owner: ContextId) -> TabulaResult<()> {
        if self.entries.get(&id).is_some_and(|slot| slot.sealed) {
            return Err(TabulaError::Sealed { id });
        }
        match self.owners.entry(id) {
            Entry::Occupied(held) if *held.get() != owner => Err(TabulaError::WriterConflict {
                id,
                owner: *held.get(),
                writer: owner,
            }),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(vacant) => {
                vacant.insert(owner);
                Ok(())
            }
        }
    }

    /// The context that claimed `id`, if any.
    pub fn owner(&self, id: ResourceId) -> Option<ContextId> {
        self.owners.get(&id).map(|owner| *owner)
    }

    /// Checked write: fails if `id` is sealed or claimed by a context other than `writer`.
    pub fn insert_as(
        &self,
        writer: ContextId,
        id: ResourceId,
        handle: ResourceHandle,
    ) -> TabulaResult<u64> {
        if let Some(owner) = self.owner(id) {
            if owner != writer {
                return Err(TabulaError::WriterConflict { id, owner, writer });
            }
        }

        match self.entries.entry(id) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().sealed {
                    return Err(TabulaError::Sealed { id });
                }
                let generation = self.stamp();
                occupied.insert(Slot {
                    handle,
                    generation,
                    sealed: false,
                });
                Ok(generation)
            }
            Entry::Vacant(vacant) => {
                let generation = self.stamp();
                vacant.insert(Slot {
                    handle,
                    generation,
                    sealed: false,
                });
                Ok(generation)
            }
        }
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted snapshot of the ids currently present.
    pub fn ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

fn typed<T: Any + Send + Sync>(id: ResourceId, handle: ResourceHandle) -> TabulaResult<Arc<T>> {
    handle.downcast::<T>().ok_or(TabulaError::TypeMismatch {
        id,
        expected: std::any::type_name::<T>(),
        found: handle.kind(),
    })
}

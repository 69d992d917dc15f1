//! The resident cache: at most one loaded object per resource id.
//!
//! Each id maps to a slot guarded by its own mutex. Map operations never
//! lock a slot, while slot holders may briefly lock the map, so the lock
//! order is always slot then map. A slot that has been removed from the map
//! is stale; callers that find one retry against the current map.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rtx_types::ResourceId;
use tracing::debug;

use crate::cleanup::CleanupChain;
use crate::error::{ServiceError, ServiceResult};
use crate::resource::{Release, Resource, TransactionalResource};

type Slot = Mutex<Option<Arc<TransactionalResource>>>;

fn lock_slot(slot: &Slot) -> MutexGuard<'_, Option<Arc<TransactionalResource>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct ResidentCache {
    slots: Mutex<HashMap<ResourceId, Arc<Slot>>>,
}

impl ResidentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ResourceId, Arc<Slot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, resource_id: &ResourceId) -> Arc<Slot> {
        Arc::clone(self.slots().entry(*resource_id).or_default())
    }

    fn is_current(&self, resource_id: &ResourceId, slot: &Arc<Slot>) -> bool {
        self.slots()
            .get(resource_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    fn evict(&self, resource_id: &ResourceId, slot: &Arc<Slot>) {
        let mut slots = self.slots();
        if slots
            .get(resource_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(resource_id);
        }
    }

    /// Add a reference to the resident object for `resource_id`, calling
    /// `load` first if it is not resident.
    ///
    /// Concurrent first calls for the same id call `load` exactly once; the
    /// others wait on the slot and share the result.
    pub fn acquire<F>(&self, resource_id: &ResourceId, mut load: F) -> ServiceResult<Arc<TransactionalResource>>
    where
        F: FnMut() -> ServiceResult<Arc<dyn Resource>>,
    {
        loop {
            let slot = self.slot(resource_id);
            let mut guard = lock_slot(&slot);
            if !self.is_current(resource_id, &slot) {
                continue;
            }
            let resource = match guard.as_ref() {
                Some(resource) => Arc::clone(resource),
                None => {
                    let delegate = match load() {
                        Ok(delegate) if delegate.id() == resource_id => delegate,
                        Ok(delegate) => {
                            self.evict(resource_id, &slot);
                            return Err(ServiceError::Load {
                                resource_id: *resource_id,
                                reason: format!("loader produced {}", delegate.id()),
                            });
                        }
                        Err(e) => {
                            self.evict(resource_id, &slot);
                            return Err(e);
                        }
                    };
                    debug!(resource = %resource_id, "resource loaded");
                    let resource = Arc::new(TransactionalResource::new(delegate));
                    *guard = Some(Arc::clone(&resource));
                    resource
                }
            };
            resource.acquire();
            return Ok(resource);
        }
    }

    /// Make a freshly created object resident with one reference.
    pub fn insert(&self, delegate: Arc<dyn Resource>) -> ServiceResult<Arc<TransactionalResource>> {
        let resource_id = *delegate.id();
        loop {
            let slot = self.slot(&resource_id);
            let mut guard = lock_slot(&slot);
            if !self.is_current(&resource_id, &slot) {
                continue;
            }
            if guard.is_some() {
                return Err(ServiceError::AlreadyResident(resource_id));
            }
            let resource = Arc::new(TransactionalResource::new(delegate));
            resource.acquire();
            *guard = Some(Arc::clone(&resource));
            return Ok(resource);
        }
    }

    /// Drop a reference to `resource`. A [`Release::Final`] result leaves
    /// the object resident until [`finalize`](Self::finalize) runs.
    ///
    /// Releasing an object that is no longer resident is a no-op and reports
    /// [`Release::AlreadyZero`].
    pub fn release(&self, resource: &Arc<TransactionalResource>) -> Release {
        let resource_id = resource.resource_id();
        let Some(slot) = self.slots().get(resource_id).cloned() else {
            debug!(resource = %resource_id, "release of a resource that is not resident");
            return Release::AlreadyZero;
        };
        let guard = lock_slot(&slot);
        if !guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, resource)) {
            return Release::AlreadyZero;
        }
        resource.release()
    }

    /// Retire `resource` after its last release: `finalize` runs with the
    /// object, which is then unloaded and evicted even if `finalize` fails.
    ///
    /// Returns `Ok(false)` without calling `finalize` if the object was
    /// acquired again or evicted since the release.
    pub fn finalize<F>(&self, resource: &Arc<TransactionalResource>, finalize: F) -> ServiceResult<bool>
    where
        F: FnOnce(&Arc<dyn Resource>) -> ServiceResult<()>,
    {
        let resource_id = resource.resource_id();
        let Some(slot) = self.slots().get(resource_id).cloned() else {
            return Ok(false);
        };
        let mut guard = lock_slot(&slot);
        let retiring = guard.as_ref().is_some_and(|current| Arc::ptr_eq(current, resource))
            && resource.count() == 0;
        if !retiring {
            debug!(resource = %resource_id, "resource reacquired before finalization");
            return Ok(false);
        }

        let delegate = Arc::clone(resource.delegate());
        let _cleanup = CleanupChain::new()
            .then(|| delegate.unload())
            .then(|| *guard = None)
            .then(|| self.evict(resource_id, &slot));
        finalize(&delegate)?;
        debug!(resource = %resource_id, "resource released");
        Ok(true)
    }

    /// The resident wrapper for `resource_id`, without adding a reference.
    pub fn get(&self, resource_id: &ResourceId) -> Option<Arc<TransactionalResource>> {
        let slot = self.slots().get(resource_id).cloned()?;
        let guard = lock_slot(&slot);
        guard.clone()
    }

    /// Evict `resource_id` regardless of its reference count. Returns the
    /// object if it was resident. The object is not unloaded.
    pub fn remove(&self, resource_id: &ResourceId) -> Option<Arc<dyn Resource>> {
        let slot = self.slots().remove(resource_id)?;
        let taken = lock_slot(&slot).take();
        taken.map(|resource| Arc::clone(resource.delegate()))
    }

    /// Evict everything. Returns the objects that were resident.
    pub fn drain(&self) -> Vec<Arc<dyn Resource>> {
        let slots: Vec<_> = self.slots().drain().map(|(_, slot)| slot).collect();
        slots
            .iter()
            .filter_map(|slot| lock_slot(slot).take())
            .map(|resource| Arc::clone(resource.delegate()))
            .collect()
    }

    /// Number of resident objects.
    pub fn len(&self) -> usize {
        let slots: Vec<_> = self.slots().values().cloned().collect();
        slots.iter().filter(|slot| lock_slot(slot).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ResidentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidentCache").field("len", &self.len()).finish()
    }
}

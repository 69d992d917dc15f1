//! Collaborator traits for domain objects and the reference-counted
//! wrapper the resident cache holds them in.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rtx_types::ResourceId;
use tracing::warn;

use crate::error::ServiceResult;

/// A loaded domain object.
pub trait Resource: Send + Sync {
    fn id(&self) -> &ResourceId;

    /// Write the persistent form of this object.
    fn serialize(&self, out: &mut dyn Write) -> io::Result<()>;

    /// Called once when the object leaves the resident cache.
    fn unload(&self) {}
}

/// Turns stored bytes back into a [`Resource`].
pub trait ResourceLoader: Send + Sync {
    fn load(&self, resource_id: &ResourceId, contents: &mut dyn Read) -> ServiceResult<Arc<dyn Resource>>;
}

/// Outcome of [`TransactionalResource::release`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// The count was already zero; nothing changed.
    AlreadyZero,
    /// This call took the count to zero.
    Final,
    /// References remain.
    Remaining(usize),
}

/// A resident object and the number of outstanding references to it.
pub struct TransactionalResource {
    delegate: Arc<dyn Resource>,
    count: AtomicUsize,
}

impl TransactionalResource {
    pub fn new(delegate: Arc<dyn Resource>) -> Self {
        Self {
            delegate,
            count: AtomicUsize::new(0),
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        self.delegate.id()
    }

    pub fn delegate(&self) -> &Arc<dyn Resource> {
        &self.delegate
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Add a reference. Returns the new count.
    pub fn acquire(&self) -> usize {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop a reference. The count never goes below zero.
    pub fn release(&self) -> Release {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!(resource = %self.resource_id(), "release of a resource with no references");
                return Release::AlreadyZero;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if current == 1 => return Release::Final,
                Ok(_) => return Release::Remaining(current - 1),
                Err(actual) => current = actual,
            }
        }
    }
}

impl std::fmt::Debug for TransactionalResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalResource")
            .field("resource_id", self.resource_id())
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_types::NodeId;

    struct Blank(ResourceId);

    impl Resource for Blank {
        fn id(&self) -> &ResourceId {
            &self.0
        }

        fn serialize(&self, _out: &mut dyn Write) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn release_clamps_at_zero() {
        let resource = TransactionalResource::new(Arc::new(Blank(ResourceId::new(NodeId::random()))));
        assert_eq!(resource.acquire(), 1);
        assert_eq!(resource.acquire(), 2);
        assert_eq!(resource.release(), Release::Remaining(1));
        assert_eq!(resource.release(), Release::Final);
        assert_eq!(resource.release(), Release::AlreadyZero);
        assert_eq!(resource.count(), 0);
    }

    #[test]
    fn concurrent_releases_finalize_once() {
        let resource = Arc::new(TransactionalResource::new(Arc::new(Blank(ResourceId::new(
            NodeId::random(),
        )))));
        for _ in 0..64 {
            resource.acquire();
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let resource = Arc::clone(&resource);
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| resource.release() == Release::Final)
                        .count()
                })
            })
            .collect();
        let finals: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(finals, 1);
        assert_eq!(resource.count(), 0);
    }
}

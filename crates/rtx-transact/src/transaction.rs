//! The public transaction surface.
//!
//! Every transaction is built by declaring the paths and ids it will touch,
//! then calling [`TransactionBuilder::begin`], which waits for an admission
//! permit and locks the declared scope. Dropping a transaction releases its
//! locks and permit; an uncommitted read-write transaction is rolled back.

use std::io::Write;
use std::marker::PhantomData;
use std::sync::Arc;

use rtx_store::{DataStore, Listing, ResourceContents};
use rtx_types::{NodeId, Path, ResourceId, TaskId, TransactionId};
use tracing::debug;

use crate::admission::AdmissionPermit;
use crate::error::{TransactError, TransactResult};
use crate::journal::MutableEntry;
use crate::persistence::TransactionalPersistence;
use crate::snapshot::{Snapshot, SnapshotBuilder, SnapshotMode, Unlink};

/// Operations available to every non-exclusive transaction.
pub trait ReadTransaction {
    /// The node this transaction operates on behalf of.
    fn node_id(&self) -> &NodeId;

    /// The snapshot backing this transaction.
    fn snapshot(&mut self) -> &mut Snapshot;

    /// Reject a path scoped to a different node.
    fn check_path(&self, path: &Path) -> TransactResult<()> {
        match path.context() {
            None | Some(rtx_types::path::WILDCARD) => Ok(()),
            Some(_) if path.node_id()? == Some(*self.node_id()) => Ok(()),
            Some(context) => Err(TransactError::InvalidArgument(format!(
                "path {path} belongs to {context}, not {}",
                self.node_id()
            ))),
        }
    }

    /// Reject a resource owned by a different node.
    fn check_resource_id(&self, resource_id: &ResourceId) -> TransactResult<()> {
        if resource_id.node_id() == self.node_id() {
            Ok(())
        } else {
            Err(TransactError::InvalidArgument(format!(
                "resource {resource_id} does not belong to {}",
                self.node_id()
            )))
        }
    }

    /// True if a resource is linked at `path`.
    fn exists(&mut self, path: &Path) -> TransactResult<bool> {
        self.check_path(path)?;
        Ok(self.snapshot().resolve(path)?.is_some())
    }

    fn exists_resource(&mut self, resource_id: &ResourceId) -> TransactResult<bool> {
        self.check_resource_id(resource_id)?;
        Ok(self
            .snapshot()
            .find_resource_entry_by_id(resource_id)?
            .is_present())
    }

    fn list(&mut self, pattern: &Path) -> TransactResult<Vec<Listing>> {
        self.check_path(pattern)?;
        self.snapshot().list(pattern)
    }

    /// The resource linked at `path`, or [`TransactError::NotFound`].
    fn get_resource_id(&mut self, path: &Path) -> TransactResult<ResourceId> {
        self.check_path(path)?;
        self.snapshot()
            .resolve(path)?
            .ok_or_else(|| TransactError::path_not_found(path))
    }

    fn load_resource_contents(
        &mut self,
        resource_id: &ResourceId,
    ) -> TransactResult<Box<dyn ResourceContents>> {
        self.check_resource_id(resource_id)?;
        self.snapshot()
            .find_resource_entry_by_id(resource_id)?
            .load_contents()
    }

    fn load_resource_contents_at(&mut self, path: &Path) -> TransactResult<Box<dyn ResourceContents>> {
        let resource_id = self.get_resource_id(path)?;
        self.load_resource_contents(&resource_id)
    }
}

/// A transaction that only reads.
pub struct ReadOnlyTransaction {
    node: NodeId,
    snapshot: Snapshot,
    _permit: AdmissionPermit,
}

impl ReadOnlyTransaction {
    /// Release the snapshot and the admission permit.
    pub fn close(self) {}
}

impl ReadTransaction for ReadOnlyTransaction {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn snapshot(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }
}

impl std::fmt::Debug for ReadOnlyTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlyTransaction")
            .field("node", &self.node)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

/// A transaction that reads and writes through a journal entry.
///
/// Nothing is visible to other transactions until [`commit`](Self::commit).
pub struct ReadWriteTransaction {
    // Drop order matters: roll back while the scope is still locked.
    entry: MutableEntry,
    snapshot: Snapshot,
    node: NodeId,
    _permit: AdmissionPermit,
}

impl ReadTransaction for ReadWriteTransaction {
    fn node_id(&self) -> &NodeId {
        &self.node
    }

    fn snapshot(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }
}

impl ReadWriteTransaction {
    pub fn transaction_id(&self) -> TransactionId {
        self.entry.transaction_id()
    }

    fn check_concrete(path: &Path) -> TransactResult<()> {
        if path.is_wildcard() {
            Err(TransactError::InvalidArgument(format!(
                "{path} must not be a wildcard"
            )))
        } else {
            Ok(())
        }
    }

    fn check_vacant(&mut self, path: &Path) -> TransactResult<()> {
        match self.snapshot.resolve(path)? {
            Some(occupant) => Err(TransactError::Duplicate(format!(
                "path {path} already linked to {occupant}"
            ))),
            None => Ok(()),
        }
    }

    fn check_present(&mut self, resource_id: &ResourceId) -> TransactResult<()> {
        if self.snapshot.find_resource_entry_by_id(resource_id)?.is_present() {
            Ok(())
        } else {
            Err(TransactError::resource_not_found(resource_id))
        }
    }

    /// Create a resource at `path` and open a writer for its contents.
    ///
    /// Fails with [`TransactError::Duplicate`] if either the path or the id
    /// is already occupied.
    pub fn save_new_resource(
        &mut self,
        path: &Path,
        resource_id: ResourceId,
    ) -> TransactResult<Box<dyn Write + Send>> {
        self.link_new_resource(resource_id, path)?;
        self.snapshot.update_contents(&resource_id)
    }

    /// Open a writer replacing the contents of an existing resource.
    pub fn update_resource(&mut self, resource_id: &ResourceId) -> TransactResult<Box<dyn Write + Send>> {
        self.check_resource_id(resource_id)?;
        self.check_present(resource_id)?;
        self.snapshot.update_contents(resource_id)
    }

    /// Create a resource at `path` with no contents yet.
    pub fn link_new_resource(&mut self, resource_id: ResourceId, path: &Path) -> TransactResult<()> {
        self.check_path(path)?;
        self.check_resource_id(&resource_id)?;
        Self::check_concrete(path)?;
        self.check_vacant(path)?;
        self.snapshot.add(resource_id)?;
        self.snapshot.link(&resource_id, path)
    }

    /// Link an additional path to an existing resource.
    pub fn link_existing_resource(
        &mut self,
        resource_id: &ResourceId,
        destination: &Path,
    ) -> TransactResult<()> {
        self.check_path(destination)?;
        self.check_resource_id(resource_id)?;
        Self::check_concrete(destination)?;
        self.check_vacant(destination)?;
        self.check_present(resource_id)?;
        self.snapshot.link(resource_id, destination)
    }

    /// Unlink `path`. If it was the resource's last path, the resource and
    /// its tasks are deleted.
    pub fn unlink_path(&mut self, path: &Path) -> TransactResult<Unlink> {
        Self::check_concrete(path)?;
        self.check_path(path)?;
        self.snapshot.unlink(path)
    }

    /// Delete a resource with every path linked to it and its tasks.
    pub fn remove_resource(&mut self, resource_id: &ResourceId) -> TransactResult<()> {
        self.check_resource_id(resource_id)?;
        if self.snapshot.delete_resource(resource_id)? {
            Ok(())
        } else {
            Err(TransactError::resource_not_found(resource_id))
        }
    }

    /// Delete up to `max` of the resources listed under `pattern`. Returns
    /// the ids deleted.
    pub fn remove_resources(&mut self, pattern: &Path, max: usize) -> TransactResult<Vec<ResourceId>> {
        self.check_path(pattern)?;
        let listings = self.snapshot.list(pattern)?;
        let mut removed = Vec::new();
        for listing in listings {
            if removed.len() >= max {
                break;
            }
            if self.snapshot.delete_resource(&listing.resource_id)? {
                removed.push(listing.resource_id);
            }
        }
        Ok(removed)
    }

    /// Schedule `task` to fire at `fire_at` (milliseconds since the Unix
    /// epoch).
    pub fn create_task(&mut self, task: &TaskId, fire_at: u64) -> TransactResult<()> {
        let resource_id = *task.resource_id();
        self.check_resource_id(&resource_id)?;
        self.check_present(&resource_id)?;
        self.snapshot.task_entry_mut(&resource_id)?.put(*task, fire_at)
    }

    pub fn delete_task(&mut self, task: &TaskId) -> TransactResult<()> {
        let resource_id = *task.resource_id();
        self.check_resource_id(&resource_id)?;
        self.check_present(&resource_id)?;
        if self.snapshot.task_entry_mut(&resource_id)?.remove(task)? {
            Ok(())
        } else {
            Err(TransactError::NoSuchTask(*task))
        }
    }

    /// Discard every change.
    pub fn rollback(mut self) -> TransactResult<()> {
        self.entry.rollback()
    }

    /// Stage every diverged entry, then commit the journal entry.
    ///
    /// If staging fails the transaction is rolled back when dropped.
    pub fn commit(mut self) -> TransactResult<TransactionId> {
        let transaction = self.entry.transaction_id();
        self.snapshot.flush(&mut self.entry)?;
        self.entry.commit()?;
        Ok(transaction)
    }
}

impl std::fmt::Debug for ReadWriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteTransaction")
            .field("node", &self.node)
            .field("entry", &self.entry)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}

/// A transaction holding every admission permit.
///
/// Operates on the store directly, without a snapshot or journal entry.
/// Reserved for whole-store operations.
pub struct ExclusiveReadWriteTransaction {
    store: Arc<dyn DataStore>,
    _permit: AdmissionPermit,
}

impl ExclusiveReadWriteTransaction {
    pub(crate) fn new(store: Arc<dyn DataStore>, permit: AdmissionPermit) -> Self {
        Self {
            store,
            _permit: permit,
        }
    }

    pub fn perform_operation<F>(&self, operation: F) -> TransactResult<()>
    where
        F: FnOnce(&dyn DataStore) -> TransactResult<()>,
    {
        operation(self.store.as_ref())
    }

    pub fn compute_operation<T, F>(&self, operation: F) -> TransactResult<T>
    where
        F: FnOnce(&dyn DataStore) -> TransactResult<T>,
    {
        operation(self.store.as_ref())
    }

    /// Release every permit.
    pub fn close(self) {}
}

/// A transaction kind that a [`TransactionBuilder`] can begin.
pub trait Begin: Sized {
    fn begin(builder: TransactionBuilder<Self>) -> TransactResult<Self>;
}

/// Collects the scope of a transaction before it begins.
pub struct TransactionBuilder<T> {
    persistence: TransactionalPersistence,
    node: NodeId,
    snapshot: SnapshotBuilder,
    _transaction: PhantomData<fn() -> T>,
}

impl<T: Begin> TransactionBuilder<T> {
    pub(crate) fn new(persistence: TransactionalPersistence, node: NodeId, mode: SnapshotMode) -> Self {
        let snapshot = SnapshotBuilder::new(
            Arc::clone(persistence.data_store()),
            Arc::clone(persistence.lock_table()),
            mode,
        );
        Self {
            persistence,
            node,
            snapshot,
            _transaction: PhantomData,
        }
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.snapshot = self.snapshot.with_path(path);
        self
    }

    pub fn with_paths(self, paths: impl IntoIterator<Item = Path>) -> Self {
        paths.into_iter().fold(self, Self::with_path)
    }

    pub fn with_resource_id(mut self, resource_id: ResourceId) -> Self {
        self.snapshot = self.snapshot.with_resource_id(resource_id);
        self
    }

    pub fn with_resource_ids(self, resource_ids: impl IntoIterator<Item = ResourceId>) -> Self {
        resource_ids.into_iter().fold(self, Self::with_resource_id)
    }

    /// Wait for admission, then lock the declared scope.
    pub fn begin(self) -> TransactResult<T> {
        T::begin(self)
    }
}

impl Begin for ReadOnlyTransaction {
    fn begin(builder: TransactionBuilder<Self>) -> TransactResult<Self> {
        let permit = builder.persistence.admission().acquire()?;
        let snapshot = builder.snapshot.build()?;
        Ok(Self {
            node: builder.node,
            snapshot,
            _permit: permit,
        })
    }
}

impl Begin for ReadWriteTransaction {
    fn begin(builder: TransactionBuilder<Self>) -> TransactResult<Self> {
        let permit = builder.persistence.admission().acquire()?;
        let snapshot = builder.snapshot.build()?;
        let entry = builder.persistence.journal().new_mutable_entry(builder.node)?;
        debug!(txn = %entry.transaction_id(), node = %builder.node, "read-write transaction began");
        Ok(Self {
            entry,
            snapshot,
            node: builder.node,
            _permit: permit,
        })
    }
}

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rtx_types::{NodeId, Path, ResourceId, TaskId, TransactionId};

use crate::contents::WritableContents;
use crate::error::StoreResult;
use crate::record::{Listing, ResourceRecord, TaskRecord};

/// Forward mapping from concrete paths to resource ids.
///
/// Changes are staged per transaction with `apply_change` and become
/// visible to readers only after `commit`. `cleanup` discards staged changes.
/// Both `commit` and `cleanup` must be idempotent: the journal may replay
/// either one for a transaction that has already been resolved.
pub trait PathIndex: Send + Sync {
    /// The resource committed at `path`, if any.
    fn find_entry(&self, path: &Path) -> StoreResult<Option<ResourceId>>;

    /// Every committed path covered by `pattern`, in path order.
    fn list(&self, pattern: &Path) -> StoreResult<Vec<Listing>>;

    /// Stage linking (`Some`) or unlinking (`None`) of `path`.
    fn apply_change(
        &self,
        transaction: TransactionId,
        path: &Path,
        resource_id: Option<ResourceId>,
    ) -> StoreResult<()>;

    fn commit(&self, transaction: TransactionId, path: &Path) -> StoreResult<()>;

    fn cleanup(&self, transaction: TransactionId, path: &Path) -> StoreResult<()>;
}

/// Contents and reverse paths of every resource.
///
/// A resource whose reverse-path set is committed as empty is removed.
pub trait ResourceIndex: Send + Sync {
    fn find_entry(&self, resource_id: &ResourceId) -> StoreResult<Option<ResourceRecord>>;

    /// A blank record for a resource about to be created.
    ///
    /// Fails with [`StoreError::DuplicateResource`](crate::StoreError::DuplicateResource)
    /// if the id is already committed.
    fn new_entry(&self, resource_id: &ResourceId) -> StoreResult<ResourceRecord>;

    /// A writable copy of the committed contents of an existing resource.
    fn update_contents(&self, resource_id: &ResourceId) -> StoreResult<WritableContents>;

    fn apply_contents_change(
        &self,
        transaction: TransactionId,
        resource_id: &ResourceId,
        contents: Bytes,
    ) -> StoreResult<()>;

    fn apply_reverse_paths_change(
        &self,
        transaction: TransactionId,
        resource_id: &ResourceId,
        reverse_paths: &BTreeSet<Path>,
    ) -> StoreResult<()>;

    fn commit(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()>;

    fn cleanup(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()>;
}

/// Scheduled tasks, grouped by owning resource.
///
/// A task set committed as empty is removed.
pub trait TaskIndex: Send + Sync {
    fn find_task_entry(&self, resource_id: &ResourceId) -> StoreResult<Option<TaskRecord>>;

    /// The committed task set, or a blank one if the resource has none.
    /// Never discards existing tasks.
    fn get_or_create_task_entry(&self, resource_id: &ResourceId) -> StoreResult<TaskRecord>;

    /// Every committed task set.
    fn list_all_entries_by_resource(&self) -> StoreResult<Vec<TaskRecord>>;

    fn apply_change(
        &self,
        transaction: TransactionId,
        resource_id: &ResourceId,
        tasks: &BTreeMap<TaskId, u64>,
    ) -> StoreResult<()>;

    fn commit(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()>;

    fn cleanup(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()>;
}

/// Aggregate of the three indices.
pub trait DataStore: Send + Sync {
    fn path_index(&self) -> &dyn PathIndex;

    fn resource_index(&self) -> &dyn ResourceIndex;

    fn task_index(&self) -> &dyn TaskIndex;

    /// Remove every committed path, resource and task owned by `node`.
    ///
    /// Callers must guarantee no transaction is open. Returns the ids of the
    /// removed resources.
    fn remove_all_resources(&self, node: &NodeId) -> StoreResult<Vec<ResourceId>>;
}

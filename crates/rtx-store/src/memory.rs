use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use rtx_types::{NodeId, Path, ResourceId, TaskId, TransactionId};
use tracing::debug;

use crate::contents::WritableContents;
use crate::error::{StoreError, StoreResult};
use crate::record::{Listing, ResourceRecord, TaskRecord};
use crate::traits::{DataStore, PathIndex, ResourceIndex, TaskIndex};

/// Committed values plus changes staged per transaction.
struct Staged<K, V, P> {
    committed: BTreeMap<K, V>,
    pending: HashMap<(TransactionId, K), P>,
}

impl<K: Ord, V, P> Default for Staged<K, V, P> {
    fn default() -> Self {
        Self {
            committed: BTreeMap::new(),
            pending: HashMap::new(),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| StoreError::Poisoned)
}

fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| StoreError::Poisoned)
}

// ---- path index ----

/// In-memory [`PathIndex`].
#[derive(Default)]
pub struct InMemoryPathIndex {
    state: RwLock<Staged<Path, ResourceId, Option<ResourceId>>>,
}

impl PathIndex for InMemoryPathIndex {
    fn find_entry(&self, path: &Path) -> StoreResult<Option<ResourceId>> {
        Ok(read(&self.state)?.committed.get(path).copied())
    }

    fn list(&self, pattern: &Path) -> StoreResult<Vec<Listing>> {
        let state = read(&self.state)?;
        Ok(state
            .committed
            .iter()
            .filter(|(path, _)| pattern.covers(path))
            .map(|(path, id)| Listing::new(path.clone(), *id))
            .collect())
    }

    fn apply_change(
        &self,
        transaction: TransactionId,
        path: &Path,
        resource_id: Option<ResourceId>,
    ) -> StoreResult<()> {
        if path.is_wildcard() {
            return Err(StoreError::WildcardPath(path.clone()));
        }
        write(&self.state)?
            .pending
            .insert((transaction, path.clone()), resource_id);
        Ok(())
    }

    fn commit(&self, transaction: TransactionId, path: &Path) -> StoreResult<()> {
        let mut state = write(&self.state)?;
        match state.pending.remove(&(transaction, path.clone())) {
            Some(Some(id)) => {
                state.committed.insert(path.clone(), id);
            }
            Some(None) => {
                state.committed.remove(path);
            }
            None => {}
        }
        Ok(())
    }

    fn cleanup(&self, transaction: TransactionId, path: &Path) -> StoreResult<()> {
        write(&self.state)?.pending.remove(&(transaction, path.clone()));
        Ok(())
    }
}

// ---- resource index ----

#[derive(Default)]
struct PendingResource {
    contents: Option<Bytes>,
    reverse_paths: Option<BTreeSet<Path>>,
}

/// In-memory [`ResourceIndex`].
#[derive(Default)]
pub struct InMemoryResourceIndex {
    state: RwLock<Staged<ResourceId, ResourceRecord, PendingResource>>,
}

impl ResourceIndex for InMemoryResourceIndex {
    fn find_entry(&self, resource_id: &ResourceId) -> StoreResult<Option<ResourceRecord>> {
        Ok(read(&self.state)?.committed.get(resource_id).cloned())
    }

    fn new_entry(&self, resource_id: &ResourceId) -> StoreResult<ResourceRecord> {
        if read(&self.state)?.committed.contains_key(resource_id) {
            return Err(StoreError::DuplicateResource(*resource_id));
        }
        Ok(ResourceRecord::empty(*resource_id))
    }

    fn update_contents(&self, resource_id: &ResourceId) -> StoreResult<WritableContents> {
        let state = read(&self.state)?;
        let record = state
            .committed
            .get(resource_id)
            .ok_or(StoreError::ResourceNotFound(*resource_id))?;
        Ok(match &record.contents {
            Some(bytes) => WritableContents::seeded(bytes),
            None => WritableContents::new(),
        })
    }

    fn apply_contents_change(
        &self,
        transaction: TransactionId,
        resource_id: &ResourceId,
        contents: Bytes,
    ) -> StoreResult<()> {
        write(&self.state)?
            .pending
            .entry((transaction, *resource_id))
            .or_default()
            .contents = Some(contents);
        Ok(())
    }

    fn apply_reverse_paths_change(
        &self,
        transaction: TransactionId,
        resource_id: &ResourceId,
        reverse_paths: &BTreeSet<Path>,
    ) -> StoreResult<()> {
        write(&self.state)?
            .pending
            .entry((transaction, *resource_id))
            .or_default()
            .reverse_paths = Some(reverse_paths.clone());
        Ok(())
    }

    fn commit(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()> {
        let mut state = write(&self.state)?;
        let Some(pending) = state.pending.remove(&(transaction, *resource_id)) else {
            return Ok(());
        };

        if pending.reverse_paths.as_ref().is_some_and(BTreeSet::is_empty) {
            state.committed.remove(resource_id);
            return Ok(());
        }

        let record = state
            .committed
            .entry(*resource_id)
            .or_insert_with(|| ResourceRecord::empty(*resource_id));
        if let Some(contents) = pending.contents {
            record.contents = Some(contents);
        }
        if let Some(reverse_paths) = pending.reverse_paths {
            record.reverse_paths = reverse_paths;
        }
        Ok(())
    }

    fn cleanup(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()> {
        write(&self.state)?
            .pending
            .remove(&(transaction, *resource_id));
        Ok(())
    }
}

// ---- task index ----

/// In-memory [`TaskIndex`].
#[derive(Default)]
pub struct InMemoryTaskIndex {
    state: RwLock<Staged<ResourceId, BTreeMap<TaskId, u64>, BTreeMap<TaskId, u64>>>,
}

impl TaskIndex for InMemoryTaskIndex {
    fn find_task_entry(&self, resource_id: &ResourceId) -> StoreResult<Option<TaskRecord>> {
        Ok(read(&self.state)?
            .committed
            .get(resource_id)
            .map(|tasks| TaskRecord {
                resource_id: *resource_id,
                tasks: tasks.clone(),
            }))
    }

    fn get_or_create_task_entry(&self, resource_id: &ResourceId) -> StoreResult<TaskRecord> {
        Ok(self
            .find_task_entry(resource_id)?
            .unwrap_or_else(|| TaskRecord::empty(*resource_id)))
    }

    fn list_all_entries_by_resource(&self) -> StoreResult<Vec<TaskRecord>> {
        Ok(read(&self.state)?
            .committed
            .iter()
            .map(|(resource_id, tasks)| TaskRecord {
                resource_id: *resource_id,
                tasks: tasks.clone(),
            })
            .collect())
    }

    fn apply_change(
        &self,
        transaction: TransactionId,
        resource_id: &ResourceId,
        tasks: &BTreeMap<TaskId, u64>,
    ) -> StoreResult<()> {
        write(&self.state)?
            .pending
            .insert((transaction, *resource_id), tasks.clone());
        Ok(())
    }

    fn commit(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()> {
        let mut state = write(&self.state)?;
        match state.pending.remove(&(transaction, *resource_id)) {
            Some(tasks) if tasks.is_empty() => {
                state.committed.remove(resource_id);
            }
            Some(tasks) => {
                state.committed.insert(*resource_id, tasks);
            }
            None => {}
        }
        Ok(())
    }

    fn cleanup(&self, transaction: TransactionId, resource_id: &ResourceId) -> StoreResult<()> {
        write(&self.state)?
            .pending
            .remove(&(transaction, *resource_id));
        Ok(())
    }
}

// ---- data store ----

/// In-memory [`DataStore`].
///
/// Intended for tests and embedding. Staged changes survive for as long as
/// the store does, so a journal reopened over the same store can resolve
/// transactions interrupted by a simulated crash.
#[derive(Default)]
pub struct InMemoryDataStore {
    paths: InMemoryPathIndex,
    resources: InMemoryResourceIndex,
    tasks: InMemoryTaskIndex,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed resources.
    pub fn resource_count(&self) -> usize {
        self.resources
            .state
            .read()
            .map(|s| s.committed.len())
            .unwrap_or(0)
    }

    /// Number of changes staged but neither committed nor cleaned up, across
    /// all three indices.
    pub fn pending_count(&self) -> usize {
        let paths = self.paths.state.read().map(|s| s.pending.len()).unwrap_or(0);
        let resources = self
            .resources
            .state
            .read()
            .map(|s| s.pending.len())
            .unwrap_or(0);
        let tasks = self.tasks.state.read().map(|s| s.pending.len()).unwrap_or(0);
        paths + resources + tasks
    }
}

impl DataStore for InMemoryDataStore {
    fn path_index(&self) -> &dyn PathIndex {
        &self.paths
    }

    fn resource_index(&self) -> &dyn ResourceIndex {
        &self.resources
    }

    fn task_index(&self) -> &dyn TaskIndex {
        &self.tasks
    }

    fn remove_all_resources(&self, node: &NodeId) -> StoreResult<Vec<ResourceId>> {
        write(&self.paths.state)?
            .committed
            .retain(|_, id| id.node_id() != node);

        let removed: Vec<ResourceId> = {
            let mut resources = write(&self.resources.state)?;
            let removed = resources
                .committed
                .keys()
                .filter(|id| id.node_id() == node)
                .copied()
                .collect();
            resources.committed.retain(|id, _| id.node_id() != node);
            removed
        };

        write(&self.tasks.state)?
            .committed
            .retain(|id, _| id.node_id() != node);

        debug!(node = %node, removed = removed.len(), "removed all resources");
        Ok(removed)
    }
}

impl std::fmt::Debug for InMemoryDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDataStore")
            .field("resource_count", &self.resource_count())
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

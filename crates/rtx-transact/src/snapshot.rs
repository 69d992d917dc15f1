//! Transaction-scoped, copy-on-write view of the store.
//!
//! A [`Snapshot`] covers exactly the paths and resource ids declared to its
//! [`SnapshotBuilder`]. Building it locks that scope: ids first, then paths
//! in their wildcard-recursive form. Ids reached through a declared path
//! (a lookup or a listing) join the scope as they are found and are locked
//! at that point, so holding an id lock also protects the paths linked to
//! it.
//!
//! All reads and writes go to in-memory entries. Nothing reaches the store
//! until [`Snapshot::flush`] stages the diverged entries in a journal entry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use rtx_store::{DataStore, Listing, StoreError, TaskRecord};
use rtx_types::{Path, ResourceId};
use tracing::{debug, warn};

use crate::entry::{ResourceEntry, TaskEntry};
use crate::error::{TransactError, TransactResult};
use crate::journal::MutableEntry;
use crate::lock::{LockTable, Locker};

/// Whether a snapshot may be mutated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotMode {
    ReadOnly,
    ReadWrite,
}

/// Result of unlinking a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unlink {
    /// The resource that was linked at the path.
    pub resource_id: ResourceId,
    /// True if that was its last path and the resource was deleted.
    pub removed: bool,
}

/// Forward mapping of one concrete path as seen by this snapshot.
#[derive(Clone, Copy, Debug)]
struct PathSlot {
    original: Option<ResourceId>,
    current: Option<ResourceId>,
}

impl PathSlot {
    fn is_original(&self) -> bool {
        self.original == self.current
    }
}

/// Declares the scope of a [`Snapshot`] and locks it.
pub struct SnapshotBuilder {
    store: Arc<dyn DataStore>,
    lock_table: Arc<LockTable>,
    mode: SnapshotMode,
    paths: BTreeSet<Path>,
    resource_ids: BTreeSet<ResourceId>,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<dyn DataStore>, lock_table: Arc<LockTable>, mode: SnapshotMode) -> Self {
        Self {
            store,
            lock_table,
            mode,
            paths: BTreeSet::new(),
            resource_ids: BTreeSet::new(),
        }
    }

    pub fn with_path(mut self, path: Path) -> Self {
        self.paths.insert(path);
        self
    }

    pub fn with_resource_id(mut self, resource_id: ResourceId) -> Self {
        self.resource_ids.insert(resource_id);
        self
    }

    /// Lock the declared scope and open the snapshot.
    ///
    /// Fails with [`TransactError::Conflict`] without waiting if any key is
    /// held by another transaction. Locks taken before the failure are
    /// released.
    pub fn build(self) -> TransactResult<Snapshot> {
        let mut locker = self.lock_table.locker();
        for id in &self.resource_ids {
            locker.lock(*id)?;
        }
        for path in &self.paths {
            locker.lock(path.clone())?;
        }
        debug!(
            ids = self.resource_ids.len(),
            paths = self.paths.len(),
            mode = ?self.mode,
            "snapshot opened"
        );
        Ok(Snapshot {
            store: self.store,
            mode: self.mode,
            declared_paths: self.paths,
            declared_ids: self.resource_ids,
            implied_ids: BTreeSet::new(),
            resources: HashMap::new(),
            paths: BTreeMap::new(),
            tasks: HashMap::new(),
            locker,
        })
    }
}

/// A transaction's locked, bounded working set.
pub struct Snapshot {
    store: Arc<dyn DataStore>,
    mode: SnapshotMode,
    declared_paths: BTreeSet<Path>,
    declared_ids: BTreeSet<ResourceId>,
    implied_ids: BTreeSet<ResourceId>,
    resources: HashMap<ResourceId, ResourceEntry>,
    paths: BTreeMap<Path, PathSlot>,
    tasks: HashMap<ResourceId, TaskEntry>,
    locker: Locker,
}

impl Snapshot {
    pub fn mode(&self) -> SnapshotMode {
        self.mode
    }

    pub fn store(&self) -> &dyn DataStore {
        self.store.as_ref()
    }

    pub fn declared_paths(&self) -> &BTreeSet<Path> {
        &self.declared_paths
    }

    pub fn declared_ids(&self) -> &BTreeSet<ResourceId> {
        &self.declared_ids
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    // ---- scope ----

    fn check_path(&self, path: &Path) -> TransactResult<()> {
        if self.declared_paths.iter().any(|declared| declared.covers(path)) {
            Ok(())
        } else {
            Err(TransactError::ScopeViolation(format!("path {path} not declared")))
        }
    }

    fn check_id(&self, resource_id: &ResourceId) -> TransactResult<()> {
        if self.declared_ids.contains(resource_id) || self.implied_ids.contains(resource_id) {
            Ok(())
        } else {
            Err(TransactError::ScopeViolation(format!(
                "resource {resource_id} not declared"
            )))
        }
    }

    fn check_writable(&self) -> TransactResult<()> {
        match self.mode {
            SnapshotMode::ReadWrite => Ok(()),
            SnapshotMode::ReadOnly => Err(TransactError::Protocol(
                "snapshot is read-only".into(),
            )),
        }
    }

    /// Bring an id reached through a declared path into scope.
    fn imply(&mut self, resource_id: ResourceId) -> TransactResult<()> {
        if self.declared_ids.contains(&resource_id) || self.implied_ids.contains(&resource_id) {
            return Ok(());
        }
        self.locker.lock(resource_id)?;
        self.implied_ids.insert(resource_id);
        Ok(())
    }

    // ---- paths ----

    fn path_slot(&mut self, path: &Path) -> TransactResult<&mut PathSlot> {
        self.check_path(path)?;
        if path.is_wildcard() {
            return Err(TransactError::InvalidArgument(format!(
                "{path} is not a concrete path"
            )));
        }
        if !self.paths.contains_key(path) {
            let original = self.store.path_index().find_entry(path)?;
            self.paths.insert(
                path.clone(),
                PathSlot {
                    original,
                    current: original,
                },
            );
        }
        self.paths
            .get_mut(path)
            .ok_or_else(|| TransactError::Fatal(format!("path slot {path} vanished")))
    }

    /// The resource currently linked at `path`, if any.
    pub fn resolve(&mut self, path: &Path) -> TransactResult<Option<ResourceId>> {
        let slot = *self.path_slot(path)?;
        let Some(resource_id) = slot.current else {
            return Ok(None);
        };
        self.imply(resource_id)?;
        let entry = self.materialize(resource_id)?;
        if slot.is_original() && !entry.reverse_paths().contains(path) {
            warn!(
                path = %path,
                resource = %resource_id,
                "path index and reverse paths disagree"
            );
        }
        Ok(Some(resource_id))
    }

    // ---- resources ----

    fn materialize(&mut self, resource_id: ResourceId) -> TransactResult<&mut ResourceEntry> {
        if !self.resources.contains_key(&resource_id) {
            let entry = match self.store.resource_index().find_entry(&resource_id)? {
                Some(record) => {
                    for path in &record.reverse_paths {
                        if let Some(slot) = self.paths.get(path) {
                            if slot.original.is_some_and(|other| other != resource_id) {
                                warn!(
                                    path = %path,
                                    resource = %resource_id,
                                    other = ?slot.original,
                                    "two resources claim the same path"
                                );
                            }
                        }
                    }
                    match self.mode {
                        SnapshotMode::ReadOnly => ResourceEntry::read_only(record),
                        SnapshotMode::ReadWrite => ResourceEntry::copy_on_write(record),
                    }
                }
                None => ResourceEntry::absent(resource_id),
            };
            self.resources.insert(resource_id, entry);
        }
        self.resources
            .get_mut(&resource_id)
            .ok_or_else(|| TransactError::Fatal(format!("entry {resource_id} vanished")))
    }

    fn entry_mut(&mut self, resource_id: &ResourceId) -> TransactResult<&mut ResourceEntry> {
        self.check_id(resource_id)?;
        self.materialize(*resource_id)
    }

    /// The entry for `resource_id`. Absent resources yield an absent entry.
    pub fn find_resource_entry_by_id(
        &mut self,
        resource_id: &ResourceId,
    ) -> TransactResult<&ResourceEntry> {
        self.entry_mut(resource_id).map(|entry| &*entry)
    }

    /// The entry linked at `path`, if any.
    pub fn find_resource_entry(&mut self, path: &Path) -> TransactResult<Option<&ResourceEntry>> {
        match self.resolve(path)? {
            Some(resource_id) => self.find_resource_entry_by_id(&resource_id).map(Some),
            None => Ok(None),
        }
    }

    /// Mutable access for writers.
    pub fn resource_entry_mut(
        &mut self,
        resource_id: &ResourceId,
    ) -> TransactResult<&mut ResourceEntry> {
        self.check_writable()?;
        self.entry_mut(resource_id)
    }

    /// Open a writer replacing the contents of `resource_id`.
    pub fn update_contents(
        &mut self,
        resource_id: &ResourceId,
    ) -> TransactResult<Box<dyn std::io::Write + Send>> {
        self.check_writable()?;
        self.check_id(resource_id)?;
        let store = Arc::clone(&self.store);
        self.materialize(*resource_id)?.update_contents(store.as_ref())
    }

    /// Create a new, unlinked resource entry and bring it into scope.
    ///
    /// Fails with [`TransactError::Duplicate`] if the id is present, or was
    /// deleted earlier in this transaction.
    pub fn add(&mut self, resource_id: ResourceId) -> TransactResult<&mut ResourceEntry> {
        self.check_writable()?;
        self.imply(resource_id)?;
        if let Some(existing) = self.resources.get(&resource_id) {
            if existing.is_present() || existing.is_deleted() {
                return Err(TransactError::Duplicate(format!("resource {resource_id}")));
            }
        }
        match self.store.resource_index().new_entry(&resource_id) {
            Ok(_) => {}
            Err(StoreError::DuplicateResource(_)) => {
                return Err(TransactError::Duplicate(format!("resource {resource_id}")));
            }
            Err(e) => return Err(e.into()),
        }
        self.resources
            .insert(resource_id, ResourceEntry::created(resource_id));
        self.materialize(resource_id)
    }

    /// Link `path` to an existing resource.
    pub fn link(&mut self, resource_id: &ResourceId, path: &Path) -> TransactResult<()> {
        self.check_writable()?;
        if let Some(occupant) = self.path_slot(path)?.current {
            return Err(TransactError::Duplicate(format!(
                "path {path} already linked to {occupant}"
            )));
        }
        self.entry_mut(resource_id)?.link(path)?;
        self.path_slot(path)?.current = Some(*resource_id);
        Ok(())
    }

    /// Unlink `path`. Deleting the last path deletes the resource and its
    /// tasks.
    pub fn unlink(&mut self, path: &Path) -> TransactResult<Unlink> {
        self.check_writable()?;
        let resource_id = self
            .resolve(path)?
            .ok_or_else(|| TransactError::path_not_found(path))?;

        let entry = self.entry_mut(&resource_id)?;
        entry.unlink(path)?;
        let removed = entry.reverse_paths().is_empty();
        if removed {
            entry.delete()?;
        }
        self.path_slot(path)?.current = None;
        if removed {
            self.task_entry_mut(&resource_id)?.delete()?;
        }
        Ok(Unlink {
            resource_id,
            removed,
        })
    }

    /// Delete a resource, every path linked to it and its tasks. Returns
    /// `false` if it was not present.
    pub fn delete_resource(&mut self, resource_id: &ResourceId) -> TransactResult<bool> {
        self.check_writable()?;
        let entry = self.entry_mut(resource_id)?;
        if !entry.is_present() {
            return Ok(false);
        }
        let linked: Vec<Path> = entry.reverse_paths().iter().cloned().collect();
        entry.delete()?;

        for path in linked {
            match self.paths.get_mut(&path) {
                Some(slot) => slot.current = None,
                None => {
                    let original = self.store.path_index().find_entry(&path)?;
                    self.paths.insert(
                        path,
                        PathSlot {
                            original,
                            current: None,
                        },
                    );
                }
            }
        }
        self.task_entry_mut(resource_id)?.delete()?;
        Ok(true)
    }

    /// Every path covered by `pattern` with the resource linked at it.
    ///
    /// Paths changed in this snapshot shadow the committed listing, so
    /// uncommitted links and unlinks of this transaction are visible.
    pub fn list(&mut self, pattern: &Path) -> TransactResult<Vec<Listing>> {
        self.check_path(pattern)?;
        let mut listed: BTreeMap<Path, ResourceId> = self
            .store
            .path_index()
            .list(pattern)?
            .into_iter()
            .filter(|listing| !self.paths.contains_key(&listing.path))
            .map(|listing| (listing.path, listing.resource_id))
            .collect();
        for (path, slot) in &self.paths {
            if let Some(resource_id) = slot.current {
                if pattern.covers(path) {
                    listed.insert(path.clone(), resource_id);
                }
            }
        }

        let mut listings = Vec::with_capacity(listed.len());
        for (path, resource_id) in listed {
            self.imply(resource_id)?;
            listings.push(Listing::new(path, resource_id));
        }
        Ok(listings)
    }

    // ---- tasks ----

    fn materialize_tasks(&mut self, resource_id: &ResourceId) -> TransactResult<&mut TaskEntry> {
        self.check_id(resource_id)?;
        if !self.tasks.contains_key(resource_id) {
            let present = self.materialize(*resource_id)?.is_present();
            let task_index = self.store.task_index();
            let entry = match (present, self.mode) {
                (false, _) => TaskEntry::absent(*resource_id),
                (true, SnapshotMode::ReadOnly) => TaskEntry::read_only(
                    task_index
                        .find_task_entry(resource_id)?
                        .unwrap_or_else(|| TaskRecord::empty(*resource_id)),
                ),
                (true, SnapshotMode::ReadWrite) => {
                    TaskEntry::copy_on_write(task_index.get_or_create_task_entry(resource_id)?)
                }
            };
            self.tasks.insert(*resource_id, entry);
        }
        self.tasks
            .get_mut(resource_id)
            .ok_or_else(|| TransactError::Fatal(format!("task entry {resource_id} vanished")))
    }

    pub fn find_task_entry(&mut self, resource_id: &ResourceId) -> TransactResult<&TaskEntry> {
        self.materialize_tasks(resource_id).map(|entry| &*entry)
    }

    /// Mutable task entry of `resource_id`. Absent resources yield an
    /// absent entry that rejects every change.
    pub fn task_entry_mut(&mut self, resource_id: &ResourceId) -> TransactResult<&mut TaskEntry> {
        self.check_writable()?;
        self.materialize_tasks(resource_id)
    }

    // ---- commit ----

    /// True if nothing in this snapshot diverged from committed state.
    pub fn is_unchanged(&self) -> bool {
        self.tasks.values().all(TaskEntry::is_original)
            && self.resources.values().all(ResourceEntry::is_original)
            && self.paths.values().all(PathSlot::is_original)
    }

    /// Stage every diverged entry in `journal`: tasks, then resources, then
    /// path mappings.
    pub fn flush(&self, journal: &mut MutableEntry) -> TransactResult<()> {
        self.check_writable()?;
        for entry in self.tasks.values() {
            entry.flush(journal)?;
        }
        for entry in self.resources.values() {
            entry.flush(journal)?;
        }
        for (path, slot) in &self.paths {
            if !slot.is_original() {
                journal.apply_path_change(path, slot.current)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("mode", &self.mode)
            .field("declared_paths", &self.declared_paths)
            .field("declared_ids", &self.declared_ids)
            .field("implied_ids", &self.implied_ids)
            .field("entries", &self.resources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtx_store::InMemoryDataStore;
    use rtx_types::{NodeId, TaskId};

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryDataStore>,
        locks: Arc<LockTable>,
        node: NodeId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(InMemoryDataStore::new()),
                locks: Arc::new(LockTable::new()),
                node: NodeId::random(),
            }
        }

        fn builder(&self, mode: SnapshotMode) -> SnapshotBuilder {
            let store: Arc<dyn DataStore> = self.store.clone();
            SnapshotBuilder::new(store, Arc::clone(&self.locks), mode)
        }
    }

    #[test]
    fn undeclared_access_is_a_scope_violation() {
        let fx = Fixture::new();
        let mut snapshot = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a"))
            .build()
            .unwrap();
        assert!(matches!(
            snapshot.resolve(&p("/b")),
            Err(TransactError::ScopeViolation(_))
        ));
        assert!(matches!(
            snapshot.find_resource_entry_by_id(&ResourceId::new(fx.node)),
            Err(TransactError::ScopeViolation(_))
        ));
        assert!(matches!(
            snapshot.list(&p("/*")),
            Err(TransactError::ScopeViolation(_))
        ));
        assert_eq!(snapshot.resolve(&p("/a")).unwrap(), None);
    }

    #[test]
    fn overlapping_scope_conflicts() {
        let fx = Fixture::new();
        let _held = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a"))
            .build()
            .unwrap();
        let err = fx
            .builder(SnapshotMode::ReadOnly)
            .with_path(p("/a/b"))
            .build()
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(fx.locks.held_count(), 1);
    }

    #[test]
    fn add_link_and_list_within_snapshot() {
        let fx = Fixture::new();
        let id = ResourceId::new(fx.node);
        let mut snapshot = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a/**"))
            .build()
            .unwrap();

        snapshot.add(id).unwrap();
        snapshot.link(&id, &p("/a/x")).unwrap();
        assert_eq!(snapshot.resolve(&p("/a/x")).unwrap(), Some(id));

        let listed = snapshot.list(&p("/a/*")).unwrap();
        assert_eq!(listed, vec![Listing::new(p("/a/x"), id)]);
        assert!(!snapshot.is_unchanged());
    }

    #[test]
    fn add_rejects_existing_and_deleted_ids() {
        let fx = Fixture::new();
        let id = ResourceId::new(fx.node);
        let mut snapshot = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a"))
            .build()
            .unwrap();

        snapshot.add(id).unwrap();
        assert!(matches!(snapshot.add(id), Err(TransactError::Duplicate(_))));
        snapshot.link(&id, &p("/a")).unwrap();
        assert!(snapshot.unlink(&p("/a")).unwrap().removed);
        assert!(matches!(snapshot.add(id), Err(TransactError::Duplicate(_))));
    }

    #[test]
    fn link_rejects_occupied_path() {
        let fx = Fixture::new();
        let a = ResourceId::new(fx.node);
        let b = ResourceId::new(fx.node);
        let mut snapshot = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a"))
            .build()
            .unwrap();
        snapshot.add(a).unwrap();
        snapshot.add(b).unwrap();
        snapshot.link(&a, &p("/a")).unwrap();
        assert!(matches!(
            snapshot.link(&b, &p("/a")),
            Err(TransactError::Duplicate(_))
        ));
    }

    #[test]
    fn unlink_last_path_deletes_resource_and_tasks() {
        let fx = Fixture::new();
        let id = ResourceId::new(fx.node);
        let mut snapshot = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a/**"))
            .build()
            .unwrap();
        snapshot.add(id).unwrap();
        snapshot.link(&id, &p("/a/x")).unwrap();
        snapshot.link(&id, &p("/a/y")).unwrap();
        snapshot
            .task_entry_mut(&id)
            .unwrap()
            .put(TaskId::new(id), 5)
            .unwrap();

        let first = snapshot.unlink(&p("/a/x")).unwrap();
        assert!(!first.removed);
        let second = snapshot.unlink(&p("/a/y")).unwrap();
        assert!(second.removed);
        assert!(!snapshot.find_resource_entry_by_id(&id).unwrap().is_present());
        assert!(snapshot.find_task_entry(&id).unwrap().tasks().is_empty());
        assert!(snapshot.list(&p("/a/*")).unwrap().is_empty());
        assert!(matches!(
            snapshot.unlink(&p("/a/x")),
            Err(TransactError::NotFound(_))
        ));
    }

    #[test]
    fn read_only_snapshot_rejects_writes() {
        let fx = Fixture::new();
        let mut snapshot = fx
            .builder(SnapshotMode::ReadOnly)
            .with_path(p("/a"))
            .build()
            .unwrap();
        assert!(matches!(
            snapshot.add(ResourceId::new(fx.node)),
            Err(TransactError::Protocol(_))
        ));
    }

    #[test]
    fn dropping_snapshot_releases_locks() {
        let fx = Fixture::new();
        let snapshot = fx
            .builder(SnapshotMode::ReadWrite)
            .with_path(p("/a"))
            .with_resource_id(ResourceId::new(fx.node))
            .build()
            .unwrap();
        assert_eq!(fx.locks.held_count(), 2);
        drop(snapshot);
        assert_eq!(fx.locks.held_count(), 0);
    }
}

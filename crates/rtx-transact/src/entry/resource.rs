use std::collections::BTreeSet;
use std::io::Write;

use rtx_store::{DataStore, FrozenContents, ResourceContents, ResourceRecord, WritableContents};
use rtx_types::{Path, ResourceId};

use crate::error::{TransactError, TransactResult};
use crate::journal::MutableEntry;

static NO_PATHS: BTreeSet<Path> = BTreeSet::new();

/// Private overlay over one resource's committed record.
#[derive(Debug)]
struct CopyOnWrite {
    /// Committed state, `None` for a resource created in this transaction.
    original: Option<ResourceRecord>,
    reverse_paths: Option<BTreeSet<Path>>,
    contents: Option<WritableContents>,
    deleted: bool,
}

#[derive(Debug)]
enum Strategy {
    Absent,
    ReadOnly(ResourceRecord),
    CopyOnWrite(CopyOnWrite),
}

/// One resource as seen by a snapshot.
#[derive(Debug)]
pub struct ResourceEntry {
    resource_id: ResourceId,
    strategy: Strategy,
}

impl ResourceEntry {
    /// An entry for an id with no committed resource.
    pub fn absent(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            strategy: Strategy::Absent,
        }
    }

    pub fn read_only(record: ResourceRecord) -> Self {
        Self {
            resource_id: record.resource_id,
            strategy: Strategy::ReadOnly(record),
        }
    }

    pub fn copy_on_write(record: ResourceRecord) -> Self {
        Self {
            resource_id: record.resource_id,
            strategy: Strategy::CopyOnWrite(CopyOnWrite {
                original: Some(record),
                reverse_paths: None,
                contents: None,
                deleted: false,
            }),
        }
    }

    /// A resource new in this transaction: no paths and no contents yet.
    pub fn created(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            strategy: Strategy::CopyOnWrite(CopyOnWrite {
                original: None,
                reverse_paths: Some(BTreeSet::new()),
                contents: None,
                deleted: false,
            }),
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn is_present(&self) -> bool {
        match &self.strategy {
            Strategy::Absent => false,
            Strategy::ReadOnly(_) => true,
            Strategy::CopyOnWrite(cow) => !cow.deleted,
        }
    }

    /// True if this entry was deleted in the current transaction.
    pub fn is_deleted(&self) -> bool {
        matches!(&self.strategy, Strategy::CopyOnWrite(cow) if cow.deleted)
    }

    /// True until the first mutation.
    pub fn is_original(&self) -> bool {
        match &self.strategy {
            Strategy::Absent | Strategy::ReadOnly(_) => true,
            Strategy::CopyOnWrite(cow) => {
                cow.original.is_some()
                    && !cow.deleted
                    && cow.reverse_paths.is_none()
                    && cow.contents.is_none()
            }
        }
    }

    /// Every path currently linked to this resource.
    pub fn reverse_paths(&self) -> &BTreeSet<Path> {
        match &self.strategy {
            Strategy::Absent => &NO_PATHS,
            Strategy::ReadOnly(record) => &record.reverse_paths,
            Strategy::CopyOnWrite(cow) => match (&cow.reverse_paths, &cow.original) {
                (Some(paths), _) => paths,
                (None, Some(record)) => &record.reverse_paths,
                (None, None) => &NO_PATHS,
            },
        }
    }

    /// The committed reverse paths, ignoring changes in this transaction.
    pub fn original_reverse_paths(&self) -> &BTreeSet<Path> {
        match &self.strategy {
            Strategy::Absent => &NO_PATHS,
            Strategy::ReadOnly(record) => &record.reverse_paths,
            Strategy::CopyOnWrite(cow) => cow
                .original
                .as_ref()
                .map_or(&NO_PATHS, |record| &record.reverse_paths),
        }
    }

    /// Open the contents for reading.
    ///
    /// A present resource without contents has been linked but never
    /// written, which is reported as [`TransactError::NullResource`].
    pub fn load_contents(&self) -> TransactResult<Box<dyn ResourceContents>> {
        let committed = |record: &ResourceRecord| -> TransactResult<Box<dyn ResourceContents>> {
            record
                .contents
                .clone()
                .map(|bytes| Box::new(FrozenContents::new(bytes)) as Box<dyn ResourceContents>)
                .ok_or(TransactError::NullResource(self.resource_id))
        };
        match &self.strategy {
            Strategy::Absent => Err(TransactError::resource_not_found(&self.resource_id)),
            Strategy::ReadOnly(record) => committed(record),
            Strategy::CopyOnWrite(cow) if cow.deleted => {
                Err(TransactError::resource_not_found(&self.resource_id))
            }
            Strategy::CopyOnWrite(cow) => match (&cow.contents, &cow.original) {
                (Some(contents), _) => Ok(Box::new(contents.clone())),
                (None, Some(record)) => committed(record),
                (None, None) => Err(TransactError::NullResource(self.resource_id)),
            },
        }
    }

    fn overlay(&mut self) -> TransactResult<&mut CopyOnWrite> {
        match &mut self.strategy {
            Strategy::Absent => Err(TransactError::resource_not_found(&self.resource_id)),
            Strategy::ReadOnly(_) => Err(TransactError::Protocol(format!(
                "resource {} is read-only in this transaction",
                self.resource_id
            ))),
            Strategy::CopyOnWrite(cow) if cow.deleted => {
                Err(TransactError::resource_not_found(&self.resource_id))
            }
            Strategy::CopyOnWrite(cow) => Ok(cow),
        }
    }

    fn overlay_paths(cow: &mut CopyOnWrite) -> &mut BTreeSet<Path> {
        let original = &cow.original;
        cow.reverse_paths.get_or_insert_with(|| {
            original
                .as_ref()
                .map(|record| record.reverse_paths.clone())
                .unwrap_or_default()
        })
    }

    /// Open a writer that replaces the contents.
    ///
    /// The first call creates the writable overlay, seeded from committed
    /// contents through the store.
    pub fn update_contents(&mut self, store: &dyn DataStore) -> TransactResult<Box<dyn Write + Send>> {
        let resource_id = self.resource_id;
        let cow = self.overlay()?;
        if cow.contents.is_none() {
            let contents = match &cow.original {
                Some(_) => store.resource_index().update_contents(&resource_id)?,
                None => WritableContents::new(),
            };
            cow.contents = Some(contents);
        }
        cow.contents
            .as_ref()
            .and_then(|contents| contents.writer())
            .ok_or_else(|| TransactError::Fatal(format!("contents of {resource_id} not writable")))
    }

    /// Add `path` to the reverse-path set.
    pub fn link(&mut self, path: &Path) -> TransactResult<()> {
        let resource_id = self.resource_id;
        let cow = self.overlay()?;
        if !Self::overlay_paths(cow).insert(path.clone()) {
            return Err(TransactError::Duplicate(format!(
                "{path} already linked to {resource_id}"
            )));
        }
        Ok(())
    }

    /// Remove `path` from the reverse-path set.
    pub fn unlink(&mut self, path: &Path) -> TransactResult<()> {
        let resource_id = self.resource_id;
        let cow = self.overlay()?;
        if !Self::overlay_paths(cow).remove(path) {
            return Err(TransactError::NotFound(format!(
                "{path} is not linked to {resource_id}"
            )));
        }
        Ok(())
    }

    /// Mark the resource deleted. Returns `false` if it was not present.
    pub fn delete(&mut self) -> TransactResult<bool> {
        match &mut self.strategy {
            Strategy::Absent => Ok(false),
            Strategy::ReadOnly(_) => Err(TransactError::Protocol(format!(
                "resource {} is read-only in this transaction",
                self.resource_id
            ))),
            Strategy::CopyOnWrite(cow) if cow.deleted => Ok(false),
            Strategy::CopyOnWrite(cow) => {
                cow.deleted = true;
                cow.reverse_paths = Some(BTreeSet::new());
                cow.contents = None;
                Ok(true)
            }
        }
    }

    /// Stage every change of this entry in the journal.
    ///
    /// Path mappings are flushed by the snapshot; this writes contents and
    /// the reverse-path set only. A deleted entry is written as an empty
    /// reverse-path set.
    pub fn flush(&self, journal: &mut MutableEntry) -> TransactResult<()> {
        let Strategy::CopyOnWrite(cow) = &self.strategy else {
            return Ok(());
        };
        if self.is_original() {
            return Ok(());
        }
        if cow.deleted {
            if cow.original.is_some() {
                journal.apply_reverse_paths_change(&self.resource_id, &BTreeSet::new())?;
            }
            return Ok(());
        }
        if let Some(contents) = &cow.contents {
            journal.apply_contents_change(&self.resource_id, contents.bytes())?;
        }
        if let Some(reverse_paths) = &cow.reverse_paths {
            journal.apply_reverse_paths_change(&self.resource_id, reverse_paths)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rtx_store::InMemoryDataStore;
    use rtx_types::NodeId;
    use std::io::Read;

    fn p(s: &str) -> Path {
        s.parse().unwrap()
    }

    fn record(paths: &[&str], contents: Option<&'static [u8]>) -> ResourceRecord {
        ResourceRecord {
            resource_id: ResourceId::new(NodeId::random()),
            reverse_paths: paths.iter().map(|s| p(s)).collect(),
            contents: contents.map(Bytes::from_static),
        }
    }

    fn read(entry: &ResourceEntry) -> Vec<u8> {
        let mut out = Vec::new();
        entry
            .load_contents()
            .unwrap()
            .reader()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn absent_rejects_mutation() {
        let mut entry = ResourceEntry::absent(ResourceId::new(NodeId::random()));
        assert!(!entry.is_present());
        assert!(entry.reverse_paths().is_empty());
        assert!(matches!(entry.link(&p("/a")), Err(TransactError::NotFound(_))));
        assert!(matches!(entry.load_contents(), Err(TransactError::NotFound(_))));
        assert!(!entry.delete().unwrap());
    }

    #[test]
    fn read_only_proxies_committed_state() {
        let mut entry = ResourceEntry::read_only(record(&["/a"], Some(b"abc")));
        assert!(entry.is_present());
        assert_eq!(read(&entry), b"abc");
        assert!(matches!(entry.link(&p("/b")), Err(TransactError::Protocol(_))));
        assert!(entry.is_original());
    }

    #[test]
    fn copy_on_write_clones_lazily() {
        let mut entry = ResourceEntry::copy_on_write(record(&["/a"], Some(b"abc")));
        assert!(entry.is_original());

        entry.link(&p("/b")).unwrap();
        assert!(!entry.is_original());
        assert_eq!(entry.reverse_paths().len(), 2);
        assert_eq!(entry.original_reverse_paths().len(), 1);
        assert_eq!(read(&entry), b"abc");
    }

    #[test]
    fn link_and_unlink_check_preconditions() {
        let mut entry = ResourceEntry::copy_on_write(record(&["/a"], Some(b"abc")));
        assert!(matches!(entry.link(&p("/a")), Err(TransactError::Duplicate(_))));
        assert!(matches!(entry.unlink(&p("/b")), Err(TransactError::NotFound(_))));
        entry.unlink(&p("/a")).unwrap();
        assert!(entry.reverse_paths().is_empty());
    }

    #[test]
    fn update_contents_seeds_from_store() {
        let store = InMemoryDataStore::new();
        let mut entry = ResourceEntry::created(ResourceId::new(NodeId::random()));
        entry.update_contents(&store).unwrap().write_all(b"new").unwrap();
        assert_eq!(read(&entry), b"new");
    }

    #[test]
    fn linked_but_never_written_is_null() {
        let mut entry = ResourceEntry::created(ResourceId::new(NodeId::random()));
        entry.link(&p("/a")).unwrap();
        assert!(matches!(
            entry.load_contents(),
            Err(TransactError::NullResource(_))
        ));
    }

    #[test]
    fn delete_reports_effect_once() {
        let mut entry = ResourceEntry::copy_on_write(record(&["/a"], Some(b"abc")));
        assert!(entry.delete().unwrap());
        assert!(!entry.delete().unwrap());
        assert!(!entry.is_present());
        assert!(entry.is_deleted());
        assert!(entry.reverse_paths().is_empty());
        assert!(matches!(entry.link(&p("/a")), Err(TransactError::NotFound(_))));
    }
}

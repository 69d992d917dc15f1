use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rtx_types::{Path, ResourceId, TaskId};
use serde::{Deserialize, Serialize};

/// Committed state of one resource as held by a [`ResourceIndex`](crate::ResourceIndex).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    pub resource_id: ResourceId,
    /// Every path currently linked to this resource.
    pub reverse_paths: BTreeSet<Path>,
    /// Serialized contents. `None` for a resource that has been linked but
    /// never written.
    pub contents: Option<Bytes>,
}

impl ResourceRecord {
    /// A blank record: no paths, no contents.
    pub fn empty(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            reverse_paths: BTreeSet::new(),
            contents: None,
        }
    }
}

/// Committed tasks of one resource as held by a [`TaskIndex`](crate::TaskIndex).
///
/// Maps each task to its absolute fire time in milliseconds since the Unix
/// epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRecord {
    pub resource_id: ResourceId,
    pub tasks: BTreeMap<TaskId, u64>,
}

impl TaskRecord {
    pub fn empty(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            tasks: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// One path and the resource linked at it, as returned by a listing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Listing {
    pub path: Path,
    pub resource_id: ResourceId,
}

impl Listing {
    pub fn new(path: Path, resource_id: ResourceId) -> Self {
        Self { path, resource_id }
    }
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TypeError;
use crate::node::NodeId;

const SEPARATOR: char = '.';

/// Stable identifier of a stored resource.
///
/// A resource id is scoped to the node that owns the resource. The string
/// form is `<node>.<uuid>`, both parts as simple (unhyphenated) hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    node: NodeId,
    uuid: Uuid,
}

impl ResourceId {
    /// Create a fresh resource id owned by `node`.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            uuid: Uuid::now_v7(),
        }
    }

    pub fn from_parts(node: NodeId, uuid: Uuid) -> Self {
        Self { node, uuid }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({self})")
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.node, self.uuid.simple())
    }
}

impl FromStr for ResourceId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidId(s.to_string());
        let (node, uuid) = s.trim().split_once(SEPARATOR).ok_or_else(invalid)?;
        if uuid.contains(SEPARATOR) {
            return Err(invalid());
        }
        Ok(Self {
            node: node.parse().map_err(|_| invalid())?,
            uuid: Uuid::parse_str(uuid).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for ResourceId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.to_string()
    }
}

/// Identifier of a scheduled task.
///
/// Tasks belong to a resource, so the task id embeds the owning
/// [`ResourceId`]. Any operation on a task can therefore derive the resource
/// it must lock. String form: `<node>.<resource-uuid>.<task-uuid>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId {
    resource: ResourceId,
    uuid: Uuid,
}

impl TaskId {
    /// Create a fresh task id for the given resource.
    pub fn new(resource: ResourceId) -> Self {
        Self {
            resource,
            uuid: Uuid::now_v7(),
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({self})")
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.resource, self.uuid.simple())
    }
}

impl FromStr for TaskId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TypeError::InvalidId(s.to_string());
        let (resource, uuid) = s.trim().rsplit_once(SEPARATOR).ok_or_else(invalid)?;
        Ok(Self {
            resource: resource.parse().map_err(|_| invalid())?,
            uuid: Uuid::parse_str(uuid).map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for TaskId {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.to_string()
    }
}

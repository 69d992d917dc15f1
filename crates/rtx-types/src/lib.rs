//! Foundation types for the transactional resource store (RTX).
//!
//! Every other RTX crate depends on `rtx-types`. The types here are plain
//! immutable values: they carry no storage or locking behavior of their own.
//!
//! # Key Types
//!
//! - [`NodeId`] -- Identity of the node that owns a set of resources
//! - [`Path`] -- Hierarchical, optionally wildcarded address scoped to a node
//! - [`ResourceId`] -- Stable node-scoped identifier of a stored resource
//! - [`TaskId`] -- Identifier of a scheduled task, scoped to its resource
//! - [`TransactionId`] -- Monotonic journal transaction identifier
//! - [`Revision`] -- Comparable version marker bounded by `Zero` and `Infinity`

pub mod error;
pub mod id;
pub mod node;
pub mod path;
pub mod revision;
pub mod transaction;

pub use error::TypeError;
pub use id::{ResourceId, TaskId};
pub use node::NodeId;
pub use path::Path;
pub use revision::Revision;
pub use transaction::TransactionId;

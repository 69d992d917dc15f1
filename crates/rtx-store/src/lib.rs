//! Backing store interface for the transactional resource store.
//!
//! The transaction engine never touches storage directly. It talks to a
//! [`DataStore`] made of three indices:
//!
//! - [`PathIndex`] -- concrete path to resource id
//! - [`ResourceIndex`] -- resource id to contents and reverse paths
//! - [`TaskIndex`] -- resource id to scheduled tasks
//!
//! Every mutation is staged under a transaction id and only becomes visible
//! once the journal commits that key. Staged changes are discarded by
//! `cleanup`. Both resolutions are idempotent so recovery can replay them.
//!
//! # Storage Backends
//!
//! - [`InMemoryDataStore`] -- `BTreeMap`-based store for tests and embedding

pub mod contents;
pub mod error;
pub mod memory;
pub mod record;
pub mod traits;

pub use contents::{FrozenContents, ResourceContents, WritableContents};
pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryDataStore, InMemoryPathIndex, InMemoryResourceIndex, InMemoryTaskIndex};
pub use record::{Listing, ResourceRecord, TaskRecord};
pub use traits::{DataStore, PathIndex, ResourceIndex, TaskIndex};

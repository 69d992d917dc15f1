//! Transaction engine for the RTX resource store.
//!
//! Layers, bottom up:
//!
//! - [`lock`] -- fail-fast pessimistic lock table shared by all transactions
//! - [`admission`] -- fair semaphore bounding concurrently open transactions
//! - [`journal`] -- write-ahead journal with commit, rollback and recovery
//! - [`entry`] -- copy-on-write resource and task entries
//! - [`snapshot`] -- the locked, bounded working set of one transaction
//! - [`transaction`] -- read-only, read-write and exclusive transactions
//! - [`persistence`] -- wires the above to one [`rtx_store::DataStore`]
//!
//! ```no_run
//! use std::io::Write;
//! use std::sync::Arc;
//! use rtx_store::{DataStore, InMemoryDataStore};
//! use rtx_transact::{TransactConfig, TransactionalPersistence};
//! use rtx_types::{NodeId, ResourceId};
//!
//! # fn main() -> rtx_transact::TransactResult<()> {
//! let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
//! let persistence = TransactionalPersistence::open(store, &TransactConfig::default())?;
//! persistence.start()?;
//!
//! let node = NodeId::random();
//! let path: rtx_types::Path = "/players/alice".parse()?;
//! let mut txn = persistence.build_rw(node).with_path(path.clone()).begin()?;
//! txn.save_new_resource(&path, ResourceId::new(node))?.write_all(b"...")?;
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod config;
pub mod entry;
pub mod error;
pub mod journal;
pub mod lock;
pub mod persistence;
pub mod snapshot;
pub mod transaction;

pub use admission::{AdmissionControl, AdmissionPermit};
pub use config::{JournalConfig, SyncMode, TransactConfig};
pub use entry::{ResourceEntry, TaskEntry};
pub use error::{TransactError, TransactResult};
pub use journal::{
    JournalAnalysis, JournalRecord, MutableEntry, Mutation, PendingTransaction, RecoveryReport,
    TransactionJournal,
};
pub use lock::{LockKey, LockTable, Locker};
pub use persistence::TransactionalPersistence;
pub use snapshot::{Snapshot, SnapshotBuilder, SnapshotMode, Unlink};
pub use transaction::{
    Begin, ExclusiveReadWriteTransaction, ReadOnlyTransaction, ReadTransaction,
    ReadWriteTransaction, TransactionBuilder,
};

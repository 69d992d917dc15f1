//! The transactional persistence environment.
//!
//! [`TransactionalPersistence`] wires one [`DataStore`] to the journal, the
//! lock table and admission control, and hands out transaction builders.
//! It is cheap to clone; clones share every component.

use std::sync::Arc;

use rtx_store::DataStore;
use rtx_types::NodeId;
use tracing::info;

use crate::admission::AdmissionControl;
use crate::config::TransactConfig;
use crate::error::TransactResult;
use crate::journal::{RecoveryReport, TransactionJournal};
use crate::lock::LockTable;
use crate::snapshot::SnapshotMode;
use crate::transaction::{
    ExclusiveReadWriteTransaction, ReadOnlyTransaction, ReadWriteTransaction, TransactionBuilder,
};

struct Inner {
    store: Arc<dyn DataStore>,
    journal: Arc<TransactionJournal>,
    lock_table: Arc<LockTable>,
    admission: AdmissionControl,
}

/// Entry point for every transaction against one store.
#[derive(Clone)]
pub struct TransactionalPersistence {
    inner: Arc<Inner>,
}

impl TransactionalPersistence {
    /// Open the journal and set up admission control. Call
    /// [`start`](Self::start) before beginning any read-write transaction.
    pub fn open(store: Arc<dyn DataStore>, config: &TransactConfig) -> TransactResult<Self> {
        config.validate()?;
        let journal = TransactionJournal::open(Arc::clone(&store), &config.journal)?;
        let admission = AdmissionControl::new(config.max_concurrent_transactions)?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                journal,
                lock_table: Arc::new(LockTable::new()),
                admission,
            }),
        })
    }

    /// Recover the journal. Idempotent.
    pub fn start(&self) -> TransactResult<RecoveryReport> {
        let report = self.inner.journal.recover()?;
        info!(
            permits = self.inner.admission.capacity(),
            next = %report.next_transaction,
            "transactional persistence started"
        );
        Ok(report)
    }

    /// Stop admitting transactions. Waiting and future callers fail with
    /// [`TransactError::Fatal`](crate::TransactError::Fatal). Transactions
    /// already open run to completion.
    pub fn stop(&self) {
        self.inner.admission.close();
        info!("transactional persistence stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.admission.is_closed()
    }

    pub fn build_ro(&self, node: NodeId) -> TransactionBuilder<ReadOnlyTransaction> {
        TransactionBuilder::new(self.clone(), node, SnapshotMode::ReadOnly)
    }

    pub fn build_rw(&self, node: NodeId) -> TransactionBuilder<ReadWriteTransaction> {
        TransactionBuilder::new(self.clone(), node, SnapshotMode::ReadWrite)
    }

    /// Wait until no other transaction is open, then hold every permit.
    pub fn open_exclusive_rw(&self) -> TransactResult<ExclusiveReadWriteTransaction> {
        let permit = self.inner.admission.acquire_exclusive()?;
        Ok(ExclusiveReadWriteTransaction::new(
            Arc::clone(&self.inner.store),
            permit,
        ))
    }

    pub fn data_store(&self) -> &Arc<dyn DataStore> {
        &self.inner.store
    }

    pub fn journal(&self) -> &Arc<TransactionJournal> {
        &self.inner.journal
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.inner.lock_table
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.inner.admission
    }
}

impl std::fmt::Debug for TransactionalPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalPersistence")
            .field("journal", &self.inner.journal)
            .field("admission", &self.inner.admission)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use crate::error::TransactError;
    use crate::transaction::ReadTransaction;
    use rtx_store::InMemoryDataStore;
    use rtx_types::{Path, ResourceId};
    use std::io::Write;

    fn config(dir: &tempfile::TempDir) -> TransactConfig {
        TransactConfig {
            max_concurrent_transactions: 8,
            journal: JournalConfig {
                path: dir.path().join("journal.log"),
                ..JournalConfig::default()
            },
        }
    }

    #[test]
    fn read_write_requires_start() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let persistence = TransactionalPersistence::open(store, &config(&dir)).unwrap();
        let result = persistence
            .build_rw(NodeId::random())
            .with_path("/a".parse().unwrap())
            .begin();
        assert!(matches!(result, Err(TransactError::Protocol(_))));
    }

    #[test]
    fn stop_rejects_new_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let persistence = TransactionalPersistence::open(store, &config(&dir)).unwrap();
        persistence.start().unwrap();
        persistence.stop();
        assert!(persistence.is_stopped());
        let result = persistence.build_ro(NodeId::random()).begin();
        assert!(matches!(result, Err(TransactError::Fatal(_))));
    }

    #[test]
    fn committed_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryDataStore::new());
        let node = NodeId::random();
        let path: Path = "/a".parse().unwrap();
        let id = ResourceId::new(node);

        {
            let data_store: Arc<dyn DataStore> = store.clone();
            let persistence = TransactionalPersistence::open(data_store, &config(&dir)).unwrap();
            persistence.start().unwrap();
            let mut txn = persistence.build_rw(node).with_path(path.clone()).begin().unwrap();
            txn.save_new_resource(&path, id).unwrap().write_all(b"x").unwrap();
            txn.commit().unwrap();
        }

        let data_store: Arc<dyn DataStore> = store.clone();
        let persistence = TransactionalPersistence::open(data_store, &config(&dir)).unwrap();
        let report = persistence.start().unwrap();
        assert!(report.recommitted.is_empty());
        assert!(report.rolled_back.is_empty());

        let mut txn = persistence.build_ro(node).with_path(path.clone()).begin().unwrap();
        assert_eq!(txn.get_resource_id(&path).unwrap(), id);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DataStore> = Arc::new(InMemoryDataStore::new());
        let mut config = config(&dir);
        config.max_concurrent_transactions = 0;
        assert!(matches!(
            TransactionalPersistence::open(store, &config),
            Err(TransactError::Config(_))
        ));
    }
}

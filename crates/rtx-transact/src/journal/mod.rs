//! Write-ahead transaction journal.
//!
//! A read-write transaction owns one [`MutableEntry`]. Each change is
//! written to the log as an `Applied` record *before* it is staged in the
//! backing store, so the log always names every key a transaction may have
//! touched. Commit writes `Committed`, promotes every staged key, then writes
//! `Finished`. Rollback discards every staged key, then writes `RolledBack`.
//!
//! On start, [`TransactionJournal::recover`] resolves whatever a crash left
//! behind: committed-but-unfinished transactions are promoted again, and
//! transactions that never committed are cleaned up. Both are idempotent, so
//! a crash during recovery is itself recoverable.

mod log;
mod record;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path as FsPath;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use rtx_store::DataStore;
use rtx_types::{NodeId, Path, ResourceId, Revision, TaskId, TransactionId};
use tracing::{debug, info, warn};

pub use log::{read_records, JournalLog};
pub use record::{JournalRecord, Mutation};

use crate::config::JournalConfig;
use crate::error::{TransactError, TransactResult};

/// A transaction found in a log without a terminal record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTransaction {
    pub transaction: TransactionId,
    pub node: Option<NodeId>,
    /// True if a `Committed` record was written.
    pub committed: bool,
    pub mutations: BTreeSet<Mutation>,
}

/// The unresolved state described by a sequence of journal records.
#[derive(Clone, Debug, Default)]
pub struct JournalAnalysis {
    pub next_transaction: Option<TransactionId>,
    pub latest_committed: Option<TransactionId>,
    pub pending: BTreeMap<TransactionId, PendingTransaction>,
}

impl JournalAnalysis {
    pub fn from_records(records: &[JournalRecord]) -> Self {
        let mut analysis = Self::default();
        let mut highest: Option<TransactionId> = None;

        for record in records {
            if let Some(txn) = record.transaction() {
                highest = highest.max(Some(txn));
            }
            match record {
                JournalRecord::Checkpoint { next_transaction } => {
                    analysis.next_transaction =
                        analysis.next_transaction.max(Some(*next_transaction));
                }
                JournalRecord::Begin { transaction, node } => {
                    analysis
                        .pending
                        .entry(*transaction)
                        .or_insert_with(|| PendingTransaction {
                            transaction: *transaction,
                            node: None,
                            committed: false,
                            mutations: BTreeSet::new(),
                        })
                        .node = Some(*node);
                }
                JournalRecord::Applied {
                    transaction,
                    mutation,
                } => {
                    analysis
                        .pending
                        .entry(*transaction)
                        .or_insert_with(|| PendingTransaction {
                            transaction: *transaction,
                            node: None,
                            committed: false,
                            mutations: BTreeSet::new(),
                        })
                        .mutations
                        .insert(mutation.clone());
                }
                JournalRecord::Committed { transaction } => {
                    if let Some(pending) = analysis.pending.get_mut(transaction) {
                        pending.committed = true;
                    }
                    analysis.latest_committed = analysis.latest_committed.max(Some(*transaction));
                }
                JournalRecord::Finished { transaction }
                | JournalRecord::RolledBack { transaction } => {
                    analysis.pending.remove(transaction);
                }
            }
        }

        if let Some(highest) = highest {
            analysis.next_transaction = analysis.next_transaction.max(Some(highest.next()));
        }
        analysis
    }
}

/// Outcome of [`TransactionJournal::recover`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Committed transactions whose staged changes were promoted again.
    pub recommitted: Vec<TransactionId>,
    /// Uncommitted transactions whose staged changes were discarded.
    pub rolled_back: Vec<TransactionId>,
    pub next_transaction: TransactionId,
}

struct JournalState {
    recovered: bool,
    next_transaction: TransactionId,
    open: BTreeSet<TransactionId>,
    /// Finished in memory but not in the log; the log must keep their
    /// records until `recover` resolves them.
    unresolved: BTreeSet<TransactionId>,
    latest_committed: Revision<TransactionId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Committed,
    RolledBack,
    Unresolved,
}

/// Durable record of every read-write transaction.
pub struct TransactionJournal {
    log: JournalLog,
    store: Arc<dyn DataStore>,
    state: Mutex<JournalState>,
    checkpoint_threshold: u64,
}

impl TransactionJournal {
    /// Open the journal log. [`recover`](Self::recover) must run before any
    /// entry can be created.
    pub fn open(store: Arc<dyn DataStore>, config: &JournalConfig) -> TransactResult<Arc<Self>> {
        let log = JournalLog::open(&config.path, config.sync_mode)?;
        info!(path = %config.path.display(), size = log.offset(), "journal opened");
        Ok(Arc::new(Self {
            log,
            store,
            state: Mutex::new(JournalState {
                recovered: false,
                next_transaction: TransactionId::FIRST,
                open: BTreeSet::new(),
                unresolved: BTreeSet::new(),
                latest_committed: Revision::zero(),
            }),
            checkpoint_threshold: config.checkpoint_threshold,
        }))
    }

    /// Read and analyze a journal file without opening it for writing.
    pub fn inspect(path: &FsPath) -> TransactResult<(Vec<JournalRecord>, JournalAnalysis)> {
        let records = read_records(path)?;
        let analysis = JournalAnalysis::from_records(&records);
        Ok((records, analysis))
    }

    fn state(&self) -> TransactResult<MutexGuard<'_, JournalState>> {
        self.state
            .lock()
            .map_err(|_| TransactError::Fatal("journal state poisoned".into()))
    }

    /// Resolve every transaction the log leaves unfinished, then compact the
    /// log to a single checkpoint.
    ///
    /// Safe to call repeatedly; a second call finds nothing to do.
    pub fn recover(&self) -> TransactResult<RecoveryReport> {
        let mut state = self.state()?;
        if !state.open.is_empty() {
            return Err(TransactError::Protocol(
                "cannot recover while transactions are open".into(),
            ));
        }

        let analysis = JournalAnalysis::from_records(&self.log.recover()?);
        let next = analysis
            .next_transaction
            .unwrap_or(TransactionId::FIRST)
            .max(state.next_transaction);
        let mut report = RecoveryReport {
            next_transaction: next,
            ..RecoveryReport::default()
        };

        for (txn, pending) in &analysis.pending {
            if pending.committed {
                for mutation in &pending.mutations {
                    mutation.commit(self.store.as_ref(), *txn)?;
                }
                report.recommitted.push(*txn);
            } else {
                for mutation in &pending.mutations {
                    mutation.cleanup(self.store.as_ref(), *txn)?;
                }
                report.rolled_back.push(*txn);
            }
        }

        self.log.replace_with(&[JournalRecord::Checkpoint {
            next_transaction: next,
        }])?;

        state.recovered = true;
        state.unresolved.clear();
        state.next_transaction = next;
        if let Some(latest) = analysis.latest_committed {
            let revision = Revision::<()>::at(latest.value()).with_value(latest);
            if state.latest_committed.is_before(&revision) {
                state.latest_committed = revision;
            }
        }

        info!(
            recommitted = report.recommitted.len(),
            rolled_back = report.rolled_back.len(),
            next = %next,
            "journal recovered"
        );
        Ok(report)
    }

    /// Open a new entry for a read-write transaction on `node`.
    pub fn new_mutable_entry(self: &Arc<Self>, node: NodeId) -> TransactResult<MutableEntry> {
        let mut state = self.state()?;
        if !state.recovered {
            return Err(TransactError::Protocol("journal has not been recovered".into()));
        }
        let transaction = state.next_transaction;
        self.log.append(&JournalRecord::Begin { transaction, node })?;
        state.next_transaction = transaction.next();
        state.open.insert(transaction);
        drop(state);

        debug!(txn = %transaction, node = %node, "journal entry opened");
        Ok(MutableEntry {
            journal: Arc::clone(self),
            transaction,
            node,
            status: EntryStatus::Open,
            mutations: BTreeSet::new(),
        })
    }

    /// The most recent committed transaction, or `Zero` if none.
    pub fn latest_revision(&self) -> Revision<TransactionId> {
        self.state()
            .map(|s| s.latest_committed.clone())
            .unwrap_or_else(|_| Revision::zero())
    }

    pub fn open_transactions(&self) -> Vec<TransactionId> {
        self.state()
            .map(|s| s.open.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Compact the log if no transaction is open and none is waiting on
    /// recovery.
    pub fn checkpoint(&self) -> TransactResult<bool> {
        let state = self.state()?;
        self.checkpoint_locked(&state)
    }

    fn checkpoint_locked(&self, state: &JournalState) -> TransactResult<bool> {
        if !state.open.is_empty() || !state.unresolved.is_empty() || !state.recovered {
            return Ok(false);
        }
        self.log.replace_with(&[JournalRecord::Checkpoint {
            next_transaction: state.next_transaction,
        }])?;
        Ok(true)
    }

    pub fn log_size(&self) -> u64 {
        self.log.offset()
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn unresolved_transactions(&self) -> Vec<TransactionId> {
        self.state()
            .map(|s| s.unresolved.iter().copied().collect())
            .unwrap_or_default()
    }

    fn finish(&self, transaction: TransactionId, outcome: Outcome) -> TransactResult<()> {
        let mut state = self.state()?;
        state.open.remove(&transaction);
        if outcome == Outcome::Unresolved {
            state.unresolved.insert(transaction);
            return Ok(());
        }
        if outcome == Outcome::Committed {
            let revision = Revision::<()>::at(transaction.value()).with_value(transaction);
            if state.latest_committed.is_before(&revision) {
                state.latest_committed = revision;
            }
        }
        if self.log.offset() > self.checkpoint_threshold {
            self.checkpoint_locked(&state)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for TransactionJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionJournal")
            .field("path", &self.log.path())
            .field("size", &self.log.offset())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EntryStatus {
    Open,
    Committed,
    RolledBack,
}

/// The journal entry of one read-write transaction.
///
/// Once committed or rolled back the entry is terminal and every further
/// call fails with [`TransactError::Protocol`]. Dropping an open entry rolls
/// it back.
pub struct MutableEntry {
    journal: Arc<TransactionJournal>,
    transaction: TransactionId,
    node: NodeId,
    status: EntryStatus,
    mutations: BTreeSet<Mutation>,
}

impl MutableEntry {
    pub fn transaction_id(&self) -> TransactionId {
        self.transaction
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn is_open(&self) -> bool {
        self.status == EntryStatus::Open
    }

    pub fn mutations(&self) -> &BTreeSet<Mutation> {
        &self.mutations
    }

    fn ensure_open(&self) -> TransactResult<()> {
        match self.status {
            EntryStatus::Open => Ok(()),
            EntryStatus::Committed => Err(TransactError::Protocol(format!(
                "transaction {} already committed",
                self.transaction
            ))),
            EntryStatus::RolledBack => Err(TransactError::Protocol(format!(
                "transaction {} already rolled back",
                self.transaction
            ))),
        }
    }

    /// Log `mutation` ahead of staging it.
    fn record(&mut self, mutation: Mutation) -> TransactResult<()> {
        self.ensure_open()?;
        if !self.mutations.contains(&mutation) {
            self.journal.log.append(&JournalRecord::Applied {
                transaction: self.transaction,
                mutation: mutation.clone(),
            })?;
            self.mutations.insert(mutation);
        }
        Ok(())
    }

    fn store(&self) -> &dyn DataStore {
        self.journal.store.as_ref()
    }

    pub fn apply_path_change(
        &mut self,
        path: &Path,
        resource_id: Option<ResourceId>,
    ) -> TransactResult<()> {
        self.record(Mutation::Path(path.clone()))?;
        self.store()
            .path_index()
            .apply_change(self.transaction, path, resource_id)?;
        Ok(())
    }

    pub fn apply_contents_change(
        &mut self,
        resource_id: &ResourceId,
        contents: Bytes,
    ) -> TransactResult<()> {
        self.record(Mutation::Contents(*resource_id))?;
        self.store()
            .resource_index()
            .apply_contents_change(self.transaction, resource_id, contents)?;
        Ok(())
    }

    pub fn apply_reverse_paths_change(
        &mut self,
        resource_id: &ResourceId,
        reverse_paths: &BTreeSet<Path>,
    ) -> TransactResult<()> {
        self.record(Mutation::ReversePaths(*resource_id))?;
        self.store().resource_index().apply_reverse_paths_change(
            self.transaction,
            resource_id,
            reverse_paths,
        )?;
        Ok(())
    }

    pub fn apply_task_change(
        &mut self,
        resource_id: &ResourceId,
        tasks: &BTreeMap<TaskId, u64>,
    ) -> TransactResult<()> {
        self.record(Mutation::Tasks(*resource_id))?;
        self.store()
            .task_index()
            .apply_change(self.transaction, resource_id, tasks)?;
        Ok(())
    }

    /// Make every staged change durable and visible.
    ///
    /// After the `Committed` record is written the entry is terminal even if
    /// promoting a key fails. The transaction then leaves the open set but
    /// its records stay in the log, and [`TransactionJournal::recover`]
    /// finishes the promotion.
    pub fn commit(&mut self) -> TransactResult<()> {
        self.ensure_open()?;
        self.journal.log.append(&JournalRecord::Committed {
            transaction: self.transaction,
        })?;
        self.status = EntryStatus::Committed;

        if let Err(e) = self.promote() {
            warn!(txn = %self.transaction, error = %e, "promotion failed; left for recovery");
            self.journal.finish(self.transaction, Outcome::Unresolved)?;
            return Err(e);
        }
        self.journal.finish(self.transaction, Outcome::Committed)?;

        debug!(txn = %self.transaction, mutations = self.mutations.len(), "committed");
        Ok(())
    }

    fn promote(&self) -> TransactResult<()> {
        for mutation in &self.mutations {
            mutation.commit(self.store(), self.transaction)?;
        }
        self.journal.log.append(&JournalRecord::Finished {
            transaction: self.transaction,
        })?;
        Ok(())
    }

    /// Discard every staged change.
    ///
    /// A failed cleanup leaves the transaction to recovery, as for
    /// [`commit`](Self::commit).
    pub fn rollback(&mut self) -> TransactResult<()> {
        self.ensure_open()?;
        self.status = EntryStatus::RolledBack;

        if let Err(e) = self.discard() {
            warn!(txn = %self.transaction, error = %e, "cleanup failed; left for recovery");
            self.journal.finish(self.transaction, Outcome::Unresolved)?;
            return Err(e);
        }
        self.journal.finish(self.transaction, Outcome::RolledBack)?;

        debug!(txn = %self.transaction, mutations = self.mutations.len(), "rolled back");
        Ok(())
    }

    fn discard(&self) -> TransactResult<()> {
        for mutation in &self.mutations {
            mutation.cleanup(self.store(), self.transaction)?;
        }
        self.journal.log.append(&JournalRecord::RolledBack {
            transaction: self.transaction,
        })?;
        Ok(())
    }
}

impl Drop for MutableEntry {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.rollback() {
                warn!(txn = %self.transaction, error = %e, "rollback on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for MutableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableEntry")
            .field("transaction", &self.transaction)
            .field("status", &self.status)
            .field("mutations", &self.mutations.len())
            .finish()
    }
}

use rtx_store::{DataStore, StoreResult};
use rtx_types::{NodeId, Path, ResourceId, TransactionId};
use serde::{Deserialize, Serialize};

/// One aspect of the store touched by a transaction.
///
/// The journal records a mutation before the change is staged in the
/// backing store, so after a crash it knows exactly which keys need to be
/// committed or cleaned up.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Mutation {
    /// A path was linked or unlinked.
    Path(Path),
    /// A resource's contents were replaced.
    Contents(ResourceId),
    /// A resource's reverse-path set changed (empty means removed).
    ReversePaths(ResourceId),
    /// A resource's task set changed.
    Tasks(ResourceId),
}

impl Mutation {
    /// Promote the staged change for this key.
    pub fn commit(&self, store: &dyn DataStore, transaction: TransactionId) -> StoreResult<()> {
        match self {
            Self::Path(path) => store.path_index().commit(transaction, path),
            Self::Contents(id) | Self::ReversePaths(id) => {
                store.resource_index().commit(transaction, id)
            }
            Self::Tasks(id) => store.task_index().commit(transaction, id),
        }
    }

    /// Discard the staged change for this key.
    pub fn cleanup(&self, store: &dyn DataStore, transaction: TransactionId) -> StoreResult<()> {
        match self {
            Self::Path(path) => store.path_index().cleanup(transaction, path),
            Self::Contents(id) | Self::ReversePaths(id) => {
                store.resource_index().cleanup(transaction, id)
            }
            Self::Tasks(id) => store.task_index().cleanup(transaction, id),
        }
    }
}

/// A single entry in the journal log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A read-write transaction opened.
    Begin {
        transaction: TransactionId,
        node: NodeId,
    },
    /// A change is about to be staged in the backing store.
    Applied {
        transaction: TransactionId,
        mutation: Mutation,
    },
    /// Every change has been staged; the transaction is durable from here.
    Committed { transaction: TransactionId },
    /// Every staged change has been promoted.
    Finished { transaction: TransactionId },
    /// Every staged change has been discarded.
    RolledBack { transaction: TransactionId },
    /// Start of a compacted log. No transaction before this point is
    /// unresolved.
    Checkpoint { next_transaction: TransactionId },
}

impl JournalRecord {
    /// The transaction this record belongs to, if any.
    pub fn transaction(&self) -> Option<TransactionId> {
        match self {
            Self::Begin { transaction, .. }
            | Self::Applied { transaction, .. }
            | Self::Committed { transaction }
            | Self::Finished { transaction }
            | Self::RolledBack { transaction } => Some(*transaction),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Short label for display.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Begin { .. } => "begin",
            Self::Applied { .. } => "applied",
            Self::Committed { .. } => "committed",
            Self::Finished { .. } => "finished",
            Self::RolledBack { .. } => "rolled-back",
            Self::Checkpoint { .. } => "checkpoint",
        }
    }
}

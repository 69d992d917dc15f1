//! Global pessimistic lock table.
//!
//! Locks are fail-fast: [`Locker::try_lock`] never waits. A transaction that
//! cannot lock its scope fails with [`TransactError::Conflict`] and the
//! caller retries the whole transaction.
//!
//! Path keys are held in their wildcard-recursive form, so a lock on `/a`
//! is stored as `/a/**` and conflicts with any lock on `/a/b` or `/*`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rtx_types::{Path, ResourceId};
use tracing::trace;

use crate::error::{TransactError, TransactResult};

/// A lockable key: either a resource id or a path subtree.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Resource(ResourceId),
    Path(Path),
}

impl LockKey {
    /// The canonical form actually held in the table.
    fn canonical(self) -> Self {
        match self {
            Self::Path(path) => Self::Path(path.to_wildcard_recursive()),
            other => other,
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resource(id) => write!(f, "resource {id}"),
            Self::Path(path) => write!(f, "path {path}"),
        }
    }
}

impl From<ResourceId> for LockKey {
    fn from(id: ResourceId) -> Self {
        Self::Resource(id)
    }
}

impl From<Path> for LockKey {
    fn from(path: Path) -> Self {
        Self::Path(path)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct LockerId(u64);

#[derive(Default)]
struct LockState {
    resources: HashMap<ResourceId, LockerId>,
    paths: BTreeMap<Path, LockerId>,
}

/// The table of every lock held in the process.
#[derive(Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    next_locker: AtomicU64,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a locker that acquires keys in this table.
    pub fn locker(self: &Arc<Self>) -> Locker {
        Locker {
            table: Arc::clone(self),
            id: LockerId(self.next_locker.fetch_add(1, Ordering::Relaxed)),
            held: Vec::new(),
        }
    }

    /// Total number of keys held by all lockers.
    pub fn held_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.resources.len() + state.paths.len()
    }

    fn state(&self) -> TransactResult<MutexGuard<'_, LockState>> {
        self.state
            .lock()
            .map_err(|_| TransactError::Fatal("lock table poisoned".into()))
    }

    fn try_lock(&self, locker: LockerId, key: &LockKey) -> TransactResult<bool> {
        let mut state = self.state()?;
        match key {
            LockKey::Resource(id) => match state.resources.get(id) {
                Some(owner) => Ok(*owner == locker),
                None => {
                    state.resources.insert(*id, locker);
                    Ok(true)
                }
            },
            LockKey::Path(path) => {
                if state.paths.get(path) == Some(&locker) {
                    return Ok(true);
                }
                let contended = state
                    .paths
                    .iter()
                    .any(|(held, owner)| *owner != locker && held.matches(path));
                if contended {
                    return Ok(false);
                }
                state.paths.insert(path.clone(), locker);
                Ok(true)
            }
        }
    }

    fn unlock(&self, state: &mut LockState, locker: LockerId, key: &LockKey) {
        match key {
            LockKey::Resource(id) => {
                if state.resources.get(id) == Some(&locker) {
                    state.resources.remove(id);
                }
            }
            LockKey::Path(path) => {
                if state.paths.get(path) == Some(&locker) {
                    state.paths.remove(path);
                }
            }
        }
    }
}

/// A single owner of locks. Every key acquired through a locker is released
/// when it is dropped.
pub struct Locker {
    table: Arc<LockTable>,
    id: LockerId,
    held: Vec<LockKey>,
}

impl Locker {
    /// Acquire `key` without waiting. Returns `false` if another locker holds
    /// it or an overlapping path. Re-acquiring a held key succeeds.
    pub fn try_lock(&mut self, key: impl Into<LockKey>) -> TransactResult<bool> {
        let key = key.into().canonical();
        if self.held.contains(&key) {
            return Ok(true);
        }
        let acquired = self.table.try_lock(self.id, &key)?;
        if acquired {
            trace!(key = %key, "locked");
            self.held.push(key);
        }
        Ok(acquired)
    }

    /// Acquire `key` or fail with [`TransactError::Conflict`].
    pub fn lock(&mut self, key: impl Into<LockKey>) -> TransactResult<()> {
        let key = key.into();
        if self.try_lock(key.clone())? {
            Ok(())
        } else {
            Err(TransactError::Conflict(key.to_string()))
        }
    }

    /// Release one key if this locker holds it.
    pub fn unlock_key(&mut self, key: impl Into<LockKey>) {
        let key = key.into().canonical();
        if let Some(index) = self.held.iter().position(|held| *held == key) {
            self.held.swap_remove(index);
            let mut state = self.table.state.lock().unwrap_or_else(PoisonError::into_inner);
            self.table.unlock(&mut state, self.id, &key);
        }
    }

    /// Release every key this locker holds.
    pub fn unlock(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut state = self.table.state.lock().unwrap_or_else(PoisonError::into_inner);
        for key in self.held.drain(..) {
            self.table.unlock(&mut state, self.id, &key);
        }
    }

    pub fn holds(&self, key: impl Into<LockKey>) -> bool {
        self.held.contains(&key.into().canonical())
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.unlock();
    }
}

impl fmt::Debug for Locker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id.0)
            .field("held", &self.held)
            .finish()
    }
}

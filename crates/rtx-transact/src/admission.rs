//! Global admission control.
//!
//! Every non-exclusive transaction holds one permit for its lifetime. An
//! exclusive transaction holds all of them, so it runs only when nothing
//! else is open and nothing else opens until it finishes. Waiters are served
//! in FIFO order, so a queued exclusive request is not starved by a stream
//! of ordinary transactions.

use std::sync::Arc;

use futures::executor::block_on;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{TransactError, TransactResult};

/// Counting semaphore bounding concurrently open transactions.
pub struct AdmissionControl {
    semaphore: Arc<Semaphore>,
    capacity: u32,
}

/// Proof of admission. The permits return to the pool when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
    exclusive: bool,
}

impl AdmissionPermit {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl AdmissionControl {
    pub fn new(capacity: usize) -> TransactResult<Self> {
        let capacity = u32::try_from(capacity)
            .ok()
            .filter(|c| *c > 0 && (*c as usize) <= Semaphore::MAX_PERMITS)
            .ok_or_else(|| TransactError::Config(format!("invalid permit count {capacity}")))?;
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
        })
    }

    /// Block until one permit is available.
    pub fn acquire(&self) -> TransactResult<AdmissionPermit> {
        let permit = block_on(Arc::clone(&self.semaphore).acquire_owned())
            .map_err(|_| TransactError::Fatal("interrupted waiting for admission".into()))?;
        Ok(AdmissionPermit {
            _permit: permit,
            exclusive: false,
        })
    }

    /// Take one permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit {
                _permit: permit,
                exclusive: false,
            })
    }

    /// Block until every permit is available and take them all.
    pub fn acquire_exclusive(&self) -> TransactResult<AdmissionPermit> {
        debug!(permits = self.capacity, "waiting for exclusive admission");
        let permit = block_on(Arc::clone(&self.semaphore).acquire_many_owned(self.capacity))
            .map_err(|_| TransactError::Fatal("interrupted waiting for exclusive admission".into()))?;
        Ok(AdmissionPermit {
            _permit: permit,
            exclusive: true,
        })
    }

    /// Fail every current and future waiter with [`TransactError::Fatal`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl std::fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionControl")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_millis(150);

    #[test]
    fn rejects_zero_capacity() {
        assert!(AdmissionControl::new(0).is_err());
    }

    #[test]
    fn n_plus_one_blocks_until_release() {
        let admission = Arc::new(AdmissionControl::new(2).unwrap());
        let first = admission.acquire().unwrap();
        let _second = admission.acquire().unwrap();
        assert!(admission.try_acquire().is_none());

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&admission);
        thread::spawn(move || {
            let permit = waiter.acquire();
            tx.send(permit.is_ok()).unwrap();
        });

        assert!(rx.recv_timeout(WAIT).is_err());
        drop(first);
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn exclusive_waits_for_every_permit() {
        let admission = Arc::new(AdmissionControl::new(3).unwrap());
        let held = admission.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&admission);
        thread::spawn(move || {
            let permit = waiter.acquire_exclusive().unwrap();
            tx.send(permit.is_exclusive()).unwrap();
            drop(permit);
        });

        assert!(rx.recv_timeout(WAIT).is_err());
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }

    #[test]
    fn exclusive_blocks_new_admissions() {
        let admission = AdmissionControl::new(2).unwrap();
        let exclusive = admission.acquire_exclusive().unwrap();
        assert_eq!(admission.available(), 0);
        assert!(admission.try_acquire().is_none());
        drop(exclusive);
        assert_eq!(admission.available(), 2);
    }

    #[test]
    fn close_interrupts_waiters() {
        let admission = Arc::new(AdmissionControl::new(1).unwrap());
        let _held = admission.acquire().unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = Arc::clone(&admission);
        thread::spawn(move || {
            tx.send(waiter.acquire().map(|_| ())).unwrap();
        });

        assert!(rx.recv_timeout(WAIT).is_err());
        admission.close();
        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(result, Err(TransactError::Fatal(_))));
    }
}

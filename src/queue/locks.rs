//! Row-level lock table for the transactional queue.
//!
//! Shared/exclusive locks keyed by entry sequence number, owned by
//! transaction ids. All state lives behind one mutex; waiters park on a
//! single `Notify` and re-check after every release, bounded by the
//! configured acquisition timeout. The timeout is a fixed wall-clock wait,
//! independent of any cancellation token.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::trace;

use super::QueueError;

/// Transaction identity within the queue.
pub(crate) type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Default)]
struct RowState {
    exclusive: Option<TxnId>,
    shared: HashSet<TxnId>,
}

impl RowState {
    fn grantable(&self, txn: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.map_or(true, |owner| owner == txn),
            LockMode::Exclusive => {
                self.exclusive.map_or(true, |owner| owner == txn)
                    && self.shared.iter().all(|holder| *holder == txn)
            }
        }
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                self.shared.insert(txn);
            }
            LockMode::Exclusive => {
                self.exclusive = Some(txn);
            }
        }
    }

    fn is_free(&self) -> bool {
        self.exclusive.is_none() && self.shared.is_empty()
    }
}

pub(crate) struct LockTable {
    rows: Mutex<HashMap<u64, RowState>>,
    released: Notify,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            released: Notify::new(),
            timeout,
        }
    }

    /// Acquire a lock on one row, waiting up to the configured timeout.
    ///
    /// Re-entrant per transaction: a holder upgrades shared to exclusive
    /// when it is the sole sharer.
    pub async fn acquire(
        &self,
        txn: TxnId,
        sequence: u64,
        mode: LockMode,
    ) -> Result<(), QueueError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            // Register for wakeups before checking, so a release between
            // the check and the await is not missed.
            let wait = self.released.notified();
            tokio::pin!(wait);
            wait.as_mut().enable();

            {
                let mut rows = self.rows.lock().expect("lock table mutex");
                let state = rows.entry(sequence).or_default();
                if state.grantable(txn, mode) {
                    state.grant(txn, mode);
                    trace!(txn, sequence, ?mode, "Lock granted");
                    return Ok(());
                }
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return self.timed_out(txn, sequence);
            };
            if tokio::time::timeout(remaining, &mut wait).await.is_err() {
                return self.timed_out(txn, sequence);
            }
        }
    }

    fn timed_out(&self, txn: TxnId, sequence: u64) -> Result<(), QueueError> {
        trace!(txn, sequence, "Lock wait timed out");
        Err(QueueError::LockTimeout {
            sequence,
            waited_ms: self.timeout.as_millis() as u64,
        })
    }

    /// Acquire a lock only if it is grantable right now.
    pub fn try_acquire(&self, txn: TxnId, sequence: u64, mode: LockMode) -> bool {
        let mut rows = self.rows.lock().expect("lock table mutex");
        let state = rows.entry(sequence).or_default();
        if state.grantable(txn, mode) {
            state.grant(txn, mode);
            true
        } else {
            false
        }
    }

    /// Release a shared hold on one row, keeping any exclusive hold.
    ///
    /// Used by read-committed scans, which lock and unlock per item.
    pub fn release_shared(&self, txn: TxnId, sequence: u64) {
        let mut rows = self.rows.lock().expect("lock table mutex");
        if let Some(state) = rows.get_mut(&sequence) {
            if state.shared.remove(&txn) {
                if state.is_free() {
                    rows.remove(&sequence);
                }
                self.released.notify_waiters();
            }
        }
    }

    /// Release every lock held by a transaction, at commit or rollback.
    pub fn release_all(&self, txn: TxnId) {
        let mut rows = self.rows.lock().expect("lock table mutex");
        let mut any = false;
        rows.retain(|_, state| {
            if state.exclusive == Some(txn) {
                state.exclusive = None;
                any = true;
            }
            if state.shared.remove(&txn) {
                any = true;
            }
            !state.is_free()
        });
        if any {
            self.released.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(ms: u64) -> LockTable {
        LockTable::new(Duration::from_millis(ms))
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let locks = table(50);
        locks.acquire(1, 7, LockMode::Shared).await.unwrap();
        locks.acquire(2, 7, LockMode::Shared).await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_blocks_shared_until_timeout() {
        let locks = table(50);
        locks.acquire(1, 7, LockMode::Exclusive).await.unwrap();
        let err = locks.acquire(2, 7, LockMode::Shared).await.unwrap_err();
        assert!(matches!(err, QueueError::LockTimeout { sequence: 7, .. }));
    }

    #[tokio::test]
    async fn test_release_all_unblocks_waiter() {
        let locks = std::sync::Arc::new(table(1_000));
        locks.acquire(1, 7, LockMode::Exclusive).await.unwrap();

        let contender = locks.clone();
        let waiter =
            tokio::spawn(async move { contender.acquire(2, 7, LockMode::Exclusive).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release_all(1);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_holder_upgrades_own_shared_lock() {
        let locks = table(50);
        locks.acquire(1, 7, LockMode::Shared).await.unwrap();
        locks.acquire(1, 7, LockMode::Exclusive).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_shared_keeps_exclusive_hold() {
        let locks = table(50);
        locks.acquire(1, 7, LockMode::Exclusive).await.unwrap();
        locks.acquire(1, 7, LockMode::Shared).await.unwrap();
        locks.release_shared(1, 7);
        // Still exclusively held by txn 1
        let err = locks.acquire(2, 7, LockMode::Shared).await.unwrap_err();
        assert!(matches!(err, QueueError::LockTimeout { .. }));
    }
}

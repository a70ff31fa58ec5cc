//! Transactional outbound message queue.
//!
//! A durable, transaction-aware store of pending outbound messages, used
//! as the durability backstop of store-and-forward delivery. Operations
//! take an explicit `QueueTransaction` handle; absent one, each call is
//! its own atomic unit. Isolation levels govern read locking against the
//! row lock table; writers hold exclusive row locks until transaction
//! end, so an aborted transaction's removals are restored and its
//! enqueues discarded without ever having been visible to committed
//! readers.

mod journal;
mod locks;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::message::Message;
use journal::{Journal, JournalOp};
use locks::{LockMode, LockTable, TxnId};

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A row lock could not be acquired within the configured wait.
    /// Distinct from cancellation and from data errors: retry later.
    #[error("lock wait exceeded {waited_ms}ms on queue entry {sequence}")]
    LockTimeout { sequence: u64, waited_ms: u64 },

    /// The transaction handle no longer refers to an open transaction.
    #[error("transaction is no longer open")]
    TransactionClosed,

    /// `dequeue` requires a batch size of at least 1.
    #[error("dequeue batch size must be at least 1")]
    InvalidBatchSize,

    #[error("queue journal I/O failed: {0}")]
    Journal(#[from] std::io::Error),

    #[error("queue entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Concurrency-control strength for queue reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Never takes read locks; sees uncommitted state of others.
    ReadUncommitted,
    /// Takes and releases a shared lock per scanned committed entry.
    #[default]
    ReadCommitted,
    /// Holds shared locks on scanned entries until transaction end.
    RepeatableRead,
    /// Repeatable read plus locks on others' uncommitted enqueues, so
    /// concurrent writers block this reader (and vice versa) until end.
    Serializable,
}

/// A persisted queue entry: the serialized message envelope plus the
/// monotonic sequence number that preserves FIFO order across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub sequence: u64,
    pub enqueued_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: Message,
}

impl QueueEntry {
    fn new(sequence: u64, message: &Message) -> Self {
        Self {
            sequence,
            enqueued_at: Utc::now(),
            message: message.clone(),
        }
    }
}

/// Net effect of one committed transaction, carried by the `changed`
/// notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueChange {
    pub enqueued: usize,
    pub dequeued: usize,
}

/// Tuning for a queue instance.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Isolation for auto-committed (handle-less) calls.
    pub default_isolation: IsolationLevel,
    /// Row lock acquisition timeout.
    pub lock_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            default_isolation: IsolationLevel::ReadCommitted,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-transaction pending state.
#[derive(Default)]
struct TxnState {
    /// Uncommitted enqueues, by sequence.
    staged: BTreeMap<u64, QueueEntry>,
    /// Committed rows this transaction dequeued, pending removal.
    claimed: BTreeSet<u64>,
}

struct Shared {
    committed: Mutex<BTreeMap<u64, QueueEntry>>,
    txns: Mutex<HashMap<TxnId, TxnState>>,
    locks: LockTable,
    next_sequence: AtomicU64,
    next_txn: AtomicU64,
    changed: broadcast::Sender<QueueChange>,
    journal: Option<Journal>,
    default_isolation: IsolationLevel,
}

/// Durable, transaction-aware store of pending outbound messages.
#[derive(Clone)]
pub struct TransactionalQueue {
    shared: Arc<Shared>,
}

impl TransactionalQueue {
    /// Create a volatile in-memory queue.
    pub fn in_memory(options: QueueOptions) -> Self {
        Self::build(options, None, BTreeMap::new(), 0)
    }

    /// Open a journal-backed queue, replaying persisted entries.
    pub fn open(path: impl AsRef<Path>, options: QueueOptions) -> Result<Self, QueueError> {
        let (journal, live, next_sequence) = Journal::open(path)?;
        Ok(Self::build(options, Some(journal), live, next_sequence))
    }

    fn build(
        options: QueueOptions,
        journal: Option<Journal>,
        live: BTreeMap<u64, QueueEntry>,
        next_sequence: u64,
    ) -> Self {
        let (changed, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                committed: Mutex::new(live),
                txns: Mutex::new(HashMap::new()),
                locks: LockTable::new(options.lock_timeout),
                next_sequence: AtomicU64::new(next_sequence),
                next_txn: AtomicU64::new(1),
                changed,
                journal,
                default_isolation: options.default_isolation,
            }),
        }
    }

    /// Begin an explicit transaction at the given isolation level.
    pub fn begin(&self, isolation: IsolationLevel) -> QueueTransaction {
        let id = self.shared.next_txn.fetch_add(1, Ordering::SeqCst);
        self.shared
            .txns
            .lock()
            .expect("queue txns lock")
            .insert(id, TxnState::default());
        debug!(txn = id, ?isolation, "Queue transaction started");
        QueueTransaction {
            shared: self.shared.clone(),
            id,
            isolation,
            completed: false,
        }
    }

    /// Subscribe to commit notifications.
    pub fn changes(&self) -> broadcast::Receiver<QueueChange> {
        self.shared.changed.subscribe()
    }

    /// Append messages to the tail of the queue.
    ///
    /// Returns the number of entries staged (with a handle) or committed
    /// (auto-commit). Staged entries become visible at commit.
    pub async fn enqueue(
        &self,
        tx: Option<&QueueTransaction>,
        messages: &[Arc<Message>],
    ) -> Result<usize, QueueError> {
        match tx {
            Some(txn) => self.enqueue_in(txn.id, messages).await,
            None => {
                let txn = self.begin(self.shared.default_isolation);
                let count = self.enqueue_in(txn.id, messages).await?;
                txn.commit()?;
                Ok(count)
            }
        }
    }

    /// Remove and return up to `batch_size` oldest visible entries, FIFO;
    /// fewer if unavailable.
    pub async fn dequeue(
        &self,
        tx: Option<&QueueTransaction>,
        batch_size: usize,
    ) -> Result<Vec<Message>, QueueError> {
        match tx {
            Some(txn) => self.dequeue_in(txn.id, txn.isolation, batch_size).await,
            None => {
                let txn = self.begin(self.shared.default_isolation);
                let messages = self.dequeue_in(txn.id, txn.isolation, batch_size).await?;
                txn.commit()?;
                Ok(messages)
            }
        }
    }

    /// Count the entries visible at the transaction's isolation level.
    pub async fn count(&self, tx: Option<&QueueTransaction>) -> Result<usize, QueueError> {
        match tx {
            Some(txn) => self.count_in(txn.id, txn.isolation).await,
            None => {
                let txn = self.begin(self.shared.default_isolation);
                let count = self.count_in(txn.id, txn.isolation).await?;
                txn.commit()?;
                Ok(count)
            }
        }
    }

    async fn enqueue_in(
        &self,
        txn: TxnId,
        messages: &[Arc<Message>],
    ) -> Result<usize, QueueError> {
        for message in messages {
            let sequence = self.shared.next_sequence.fetch_add(1, Ordering::SeqCst);
            // A fresh row nobody else can reference yet; the exclusive
            // lock is held until transaction end.
            self.shared
                .locks
                .acquire(txn, sequence, LockMode::Exclusive)
                .await?;
            let mut txns = self.shared.txns.lock().expect("queue txns lock");
            let state = txns.get_mut(&txn).ok_or(QueueError::TransactionClosed)?;
            state.staged.insert(sequence, QueueEntry::new(sequence, message));
        }
        debug!(txn, staged = messages.len(), "Messages staged for enqueue");
        Ok(messages.len())
    }

    async fn dequeue_in(
        &self,
        txn: TxnId,
        isolation: IsolationLevel,
        batch_size: usize,
    ) -> Result<Vec<Message>, QueueError> {
        if batch_size == 0 {
            return Err(QueueError::InvalidBatchSize);
        }
        // Lower isolation levels skip rows locked by concurrent
        // transactions so independent dequeuers drain disjoint batches;
        // repeatable-read and serializable wait their turn.
        let blocking = matches!(
            isolation,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        );

        // Candidate scan: committed rows merged with this transaction's
        // own staged rows, ascending by sequence.
        let committed_seqs: Vec<u64> = {
            let committed = self.shared.committed.lock().expect("queue committed lock");
            committed.keys().copied().collect()
        };
        let own_staged: BTreeSet<u64> = {
            let txns = self.shared.txns.lock().expect("queue txns lock");
            let state = txns.get(&txn).ok_or(QueueError::TransactionClosed)?;
            state.staged.keys().copied().collect()
        };
        let mut candidates: Vec<u64> = committed_seqs
            .into_iter()
            .chain(own_staged.iter().copied())
            .collect();
        candidates.sort_unstable();
        candidates.dedup();

        let mut out = Vec::new();
        for sequence in candidates {
            if out.len() == batch_size {
                break;
            }

            if own_staged.contains(&sequence) {
                // Dequeuing an entry this transaction staged cancels it.
                let mut txns = self.shared.txns.lock().expect("queue txns lock");
                let state = txns.get_mut(&txn).ok_or(QueueError::TransactionClosed)?;
                if let Some(entry) = state.staged.remove(&sequence) {
                    out.push(entry.message);
                }
                continue;
            }

            if blocking {
                self.shared
                    .locks
                    .acquire(txn, sequence, LockMode::Exclusive)
                    .await?;
            } else if !self.shared.locks.try_acquire(txn, sequence, LockMode::Exclusive) {
                continue;
            }

            // The row may have been removed by a transaction that
            // committed while we waited for its lock.
            let entry = {
                let committed = self.shared.committed.lock().expect("queue committed lock");
                committed.get(&sequence).cloned()
            };
            let Some(entry) = entry else {
                continue;
            };

            let mut txns = self.shared.txns.lock().expect("queue txns lock");
            let state = txns.get_mut(&txn).ok_or(QueueError::TransactionClosed)?;
            if state.claimed.insert(sequence) {
                out.push(entry.message);
            }
        }

        debug!(txn, requested = batch_size, taken = out.len(), "Dequeued batch");
        Ok(out)
    }

    async fn count_in(&self, txn: TxnId, isolation: IsolationLevel) -> Result<usize, QueueError> {
        if isolation == IsolationLevel::ReadUncommitted {
            // Dirty read: no locks, others' pending work included.
            let committed = self.shared.committed.lock().expect("queue committed lock");
            let txns = self.shared.txns.lock().expect("queue txns lock");
            let claimed_anywhere: HashSet<u64> = txns
                .values()
                .flat_map(|state| state.claimed.iter().copied())
                .collect();
            let staged_anywhere: usize = txns.values().map(|state| state.staged.len()).sum();
            let visible_committed = committed
                .keys()
                .filter(|seq| !claimed_anywhere.contains(seq))
                .count();
            return Ok(visible_committed + staged_anywhere);
        }

        // Scan set: committed rows, plus — under serializable — other
        // transactions' staged rows, whose exclusive locks make us wait.
        let mut scan: Vec<u64> = {
            let committed = self.shared.committed.lock().expect("queue committed lock");
            committed.keys().copied().collect()
        };
        if isolation == IsolationLevel::Serializable {
            let txns = self.shared.txns.lock().expect("queue txns lock");
            for (other, state) in txns.iter() {
                if *other != txn {
                    scan.extend(state.staged.keys().copied());
                }
            }
        }

        for sequence in scan {
            self.shared
                .locks
                .acquire(txn, sequence, LockMode::Shared)
                .await?;
            if isolation == IsolationLevel::ReadCommitted {
                self.shared.locks.release_shared(txn, sequence);
            }
        }

        let committed = self.shared.committed.lock().expect("queue committed lock");
        let txns = self.shared.txns.lock().expect("queue txns lock");
        let state = txns.get(&txn).ok_or(QueueError::TransactionClosed)?;
        let visible_committed = committed
            .keys()
            .filter(|seq| !state.claimed.contains(seq))
            .count();
        Ok(visible_committed + state.staged.len())
    }
}

impl Shared {
    /// Finish a transaction, applying (commit) or discarding (rollback)
    /// its pending operations and releasing its locks.
    fn complete(&self, txn: TxnId, commit: bool) -> Result<(), QueueError> {
        let state = self
            .txns
            .lock()
            .expect("queue txns lock")
            .remove(&txn)
            .ok_or(QueueError::TransactionClosed)?;

        if !commit {
            // Claimed rows were never removed from the committed store;
            // releasing their locks restores them. Staged rows vanish.
            self.locks.release_all(txn);
            debug!(txn, discarded = state.staged.len(), restored = state.claimed.len(),
                "Queue transaction rolled back");
            return Ok(());
        }

        let enqueued = state.staged.len();
        let dequeued = state.claimed.len();

        if let Some(journal) = &self.journal {
            if enqueued > 0 || dequeued > 0 {
                let mut ops = Vec::with_capacity(enqueued + dequeued);
                for sequence in &state.claimed {
                    ops.push(JournalOp::Dequeue {
                        sequence: *sequence,
                    });
                }
                for entry in state.staged.values() {
                    ops.push(JournalOp::Enqueue {
                        entry: entry.clone(),
                    });
                }
                if let Err(e) = journal.append(&ops) {
                    // Durability failed: abandon the transaction's work.
                    self.locks.release_all(txn);
                    return Err(e);
                }
            }
        }

        {
            let mut committed = self.committed.lock().expect("queue committed lock");
            for sequence in &state.claimed {
                committed.remove(sequence);
            }
            for (sequence, entry) in state.staged {
                committed.insert(sequence, entry);
            }
        }
        self.locks.release_all(txn);

        if enqueued > 0 || dequeued > 0 {
            // Fires once per committing transaction with net counts;
            // nobody listening is fine.
            let _ = self.changed.send(QueueChange { enqueued, dequeued });
            info!(txn, enqueued, dequeued, "Queue transaction committed");
        }
        Ok(())
    }
}

/// Handle to an open queue transaction.
///
/// Dropping an unfinished handle rolls the transaction back.
pub struct QueueTransaction {
    shared: Arc<Shared>,
    id: TxnId,
    isolation: IsolationLevel,
    completed: bool,
}

impl QueueTransaction {
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Make this transaction's operations visible and durable.
    pub fn commit(mut self) -> Result<(), QueueError> {
        self.completed = true;
        self.shared.complete(self.id, true)
    }

    /// Discard staged enqueues and restore claimed entries.
    pub fn rollback(mut self) {
        self.completed = true;
        let _ = self.shared.complete(self.id, false);
    }
}

impl Drop for QueueTransaction {
    fn drop(&mut self) {
        if !self.completed {
            let _ = self.shared.complete(self.id, false);
        }
    }
}

#[cfg(test)]
mod tests;

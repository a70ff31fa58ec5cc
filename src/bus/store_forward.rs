//! Store-and-forward delivery strategy.
//!
//! Accepted messages are persisted to the transactional queue before any
//! forwarding happens. Inside a dispatch the enqueue is staged in a queue
//! transaction enlisted in the unit of work, so it commits or rolls back
//! with the operation. A background task dequeues committed batches under
//! their own transaction and sends them with backoff retry, committing the
//! removal only after the client accepted the batch — a crash between
//! enqueue and forward redelivers on the next start instead of losing
//! messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusError, DeliveryStrategy, Result};
use crate::message::Message;
use crate::queue::{IsolationLevel, QueueTransaction, TransactionalQueue};
use crate::transport::TransportClient;
use crate::uow::{FlushError, UnitOfWork, UowResource};

/// Tuning for the forwarding task.
#[derive(Debug, Clone)]
pub struct StoreForwardOptions {
    /// Entries dequeued per forwarding transaction.
    pub batch: usize,
    /// Poll interval when no change notifications arrive.
    pub interval: Duration,
    /// Send retries within one forwarding transaction.
    pub retries: usize,
    /// Isolation for staging transactions.
    pub stage_isolation: IsolationLevel,
}

impl Default for StoreForwardOptions {
    fn default() -> Self {
        Self {
            batch: 32,
            interval: Duration::from_millis(500),
            retries: 3,
            stage_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

struct ForwardTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct StoreForwardQueue {
    client: Arc<dyn TransportClient>,
    queue: TransactionalQueue,
    options: StoreForwardOptions,
    task: Mutex<Option<ForwardTask>>,
    stage_seq: AtomicU64,
}

impl StoreForwardQueue {
    pub fn new(
        client: Arc<dyn TransportClient>,
        queue: TransactionalQueue,
        options: StoreForwardOptions,
    ) -> Self {
        Self {
            client,
            queue,
            options,
            task: Mutex::new(None),
            stage_seq: AtomicU64::new(0),
        }
    }

    /// The backing queue, e.g. for backlog inspection.
    pub fn queue(&self) -> &TransactionalQueue {
        &self.queue
    }
}

#[async_trait]
impl DeliveryStrategy for StoreForwardQueue {
    fn name(&self) -> &'static str {
        "store-and-forward"
    }

    async fn deliver(
        &self,
        messages: Vec<Arc<Message>>,
        uow: Option<&UnitOfWork>,
    ) -> Result<()> {
        match uow {
            None => {
                self.queue.enqueue(None, &messages).await?;
                Ok(())
            }
            Some(uow) => {
                // Stage first: in disabled flush mode the enlistment
                // itself commits.
                let txn = self.queue.begin(self.options.stage_isolation);
                self.queue.enqueue(Some(&txn), &messages).await?;
                let stage = Arc::new(OutboxStage {
                    id: format!(
                        "outbox-stage-{}",
                        self.stage_seq.fetch_add(1, Ordering::SeqCst)
                    ),
                    txn: StdMutex::new(Some(txn)),
                });
                debug!(stage = %stage.id, staged = messages.len(), "Outbound batch staged");
                uow.enlist(stage)
                    .await
                    .map_err(|e| BusError::Staging(e.to_string()))
            }
        }
    }

    async fn on_start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward_loop(
            self.client.clone(),
            self.queue.clone(),
            self.options.clone(),
            cancel.clone(),
        ));
        *task = Some(ForwardTask { cancel, handle });
        info!("Store-and-forward consumer started");
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
            info!("Store-and-forward consumer stopped");
        }
        Ok(())
    }
}

/// Unit-of-work resource holding one staging transaction.
///
/// Flush commits the staged enqueue; abort rolls it back, which is what
/// makes store-and-forward delivery exactly-once per committed unit of
/// work.
struct OutboxStage {
    id: String,
    txn: StdMutex<Option<QueueTransaction>>,
}

#[async_trait]
impl UowResource for OutboxStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn requires_flush(&self) -> bool {
        self.txn.lock().expect("outbox stage lock").is_some()
    }

    async fn flush(&self) -> std::result::Result<(), FlushError> {
        let txn = self.txn.lock().expect("outbox stage lock").take();
        match txn {
            Some(txn) => txn
                .commit()
                .map_err(|e| FlushError::resource(&self.id, e.to_string())),
            None => Ok(()),
        }
    }

    async fn abort(&self) {
        if let Some(txn) = self.txn.lock().expect("outbox stage lock").take() {
            txn.rollback();
        }
    }
}

async fn forward_loop(
    client: Arc<dyn TransportClient>,
    queue: TransactionalQueue,
    options: StoreForwardOptions,
    cancel: CancellationToken,
) {
    let mut changes = queue.changes();
    loop {
        // Drain the backlog; the first pass after start redelivers
        // whatever a previous process left behind.
        loop {
            match forward_batch(&client, &queue, &options).await {
                Ok(0) => break,
                Ok(count) => debug!(count, "Forwarded batch from queue"),
                Err(e) => {
                    warn!(error = %e, "Forwarding failed, batch returned to queue");
                    break;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(options.interval) => {}
            received = changes.recv() => {
                if let Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) = received {
                    warn!(skipped, "Change notifications lagged");
                }
            }
        }
    }
}

/// Forward one batch under its own transaction.
///
/// The dequeue commits only after the client accepted the batch; on send
/// failure the rollback restores every entry.
async fn forward_batch(
    client: &Arc<dyn TransportClient>,
    queue: &TransactionalQueue,
    options: &StoreForwardOptions,
) -> Result<usize> {
    let txn = queue.begin(IsolationLevel::ReadCommitted);
    let messages = queue.dequeue(Some(&txn), options.batch).await?;
    if messages.is_empty() {
        txn.rollback();
        return Ok(0);
    }

    let batch: Vec<Arc<Message>> = messages.into_iter().map(Arc::new).collect();
    let count = batch.len();

    let send = || {
        let client = client.clone();
        let batch = batch.clone();
        async move { client.send(batch).await }
    };
    let sent = send
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(10))
                .with_max_times(options.retries),
        )
        .await;

    match sent {
        Ok(()) => {
            txn.commit()?;
            Ok(count)
        }
        Err(e) => {
            error!(error = %e, count, "Client rejected batch after retries");
            txn.rollback();
            Err(BusError::Client(e))
        }
    }
}

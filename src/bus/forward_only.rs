//! Forward-only delivery strategy.
//!
//! Accepted messages land in a volatile in-memory buffer; a background
//! task drains the buffer to the transport client while the sender axis
//! is started. Buffered content does not survive a crash.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DeliveryStrategy, Result};
use crate::message::Message;
use crate::transport::TransportClient;
use crate::uow::UnitOfWork;

struct ForwardTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ForwardOnlyQueue {
    client: Arc<dyn TransportClient>,
    buffer: Arc<StdMutex<VecDeque<Arc<Message>>>>,
    wake: Arc<Notify>,
    batch: usize,
    task: Mutex<Option<ForwardTask>>,
}

impl ForwardOnlyQueue {
    pub fn new(client: Arc<dyn TransportClient>, batch: usize) -> Self {
        Self {
            client,
            buffer: Arc::new(StdMutex::new(VecDeque::new())),
            wake: Arc::new(Notify::new()),
            batch: batch.max(1),
            task: Mutex::new(None),
        }
    }

    /// Messages currently buffered and not yet forwarded.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("forward buffer lock").len()
    }
}

#[async_trait]
impl DeliveryStrategy for ForwardOnlyQueue {
    fn name(&self) -> &'static str {
        "forward-only"
    }

    async fn deliver(
        &self,
        messages: Vec<Arc<Message>>,
        _uow: Option<&UnitOfWork>,
    ) -> Result<()> {
        {
            let mut buffer = self.buffer.lock().expect("forward buffer lock");
            buffer.extend(messages);
        }
        self.wake.notify_one();
        Ok(())
    }

    async fn on_start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward_loop(
            self.client.clone(),
            self.buffer.clone(),
            self.wake.clone(),
            self.batch,
            cancel.clone(),
        ));
        *task = Some(ForwardTask { cancel, handle });
        info!("Forward-only consumer started");
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.cancel.cancel();
            let _ = task.handle.await;
            info!("Forward-only consumer stopped");
        }
        Ok(())
    }
}

async fn forward_loop(
    client: Arc<dyn TransportClient>,
    buffer: Arc<StdMutex<VecDeque<Arc<Message>>>>,
    wake: Arc<Notify>,
    batch: usize,
    cancel: CancellationToken,
) {
    loop {
        let next: Vec<Arc<Message>> = {
            let mut buffer = buffer.lock().expect("forward buffer lock");
            let take = buffer.len().min(batch);
            buffer.drain(..take).collect()
        };

        if next.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => continue,
            }
        }

        match client.send(next).await {
            Ok(()) => debug!("Buffered batch forwarded"),
            // Volatile queue: a failed batch is gone, like a crash would
            // have taken it.
            Err(e) => warn!(error = %e, "Forward failed, batch dropped"),
        }
    }
}

//! Bus controller: the process-level façade for outbound message flow.
//!
//! This module contains:
//! - `BusController`: sender/receiver start-stop state machine guarding `send`
//! - `DeliveryStrategy` trait: how accepted messages reach the transport
//! - Implementations: direct-send, forward-only (volatile), store-and-forward
//!   (backed by the transactional queue)
//! - `init_controller` factory building a controller from configuration

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, StrategyKind};
use crate::message::Message;
use crate::queue::{QueueError, QueueOptions, TransactionalQueue};
use crate::transport::{ClientError, TransportClient};
use crate::uow::UnitOfWork;

// Implementation modules
pub mod direct;
pub mod forward_only;
pub mod store_forward;

// Re-exports
pub use direct::DirectSend;
pub use forward_only::ForwardOnlyQueue;
pub use store_forward::{StoreForwardOptions, StoreForwardQueue};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// An axis was started twice.
    #[error("{0} is already started")]
    AlreadyStarted(Axis),

    /// `send` was invoked without both axes started; the message would
    /// never be delivered, so it is rejected up front.
    #[error("cannot accept messages: {0} is stopped")]
    NotStarted(Axis),

    /// The controller was disposed; terminal.
    #[error("bus controller is disposed")]
    Disposed,

    /// Startup was cancelled by the host's token.
    #[error("start cancelled by host")]
    StartCancelled,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Staging into the unit of work failed.
    #[error("outbox staging failed: {0}")]
    Staging(String),
}

/// The two independent start/stop axes of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Sender,
    Receiver,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::Sender => write!(f, "sender"),
            Axis::Receiver => write!(f, "receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum AxisState {
    #[default]
    Stopped,
    Started,
}

#[derive(Debug, Default)]
struct ControllerState {
    sender: AxisState,
    receiver: AxisState,
    disposed: bool,
}

/// How accepted messages reach the external transport.
///
/// Implementations:
/// - `DirectSend`: forward immediately, no buffering
/// - `ForwardOnlyQueue`: volatile in-memory buffer
/// - `StoreForwardQueue`: transactional queue, durable across crashes
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Accept a batch of outbound messages.
    ///
    /// With a unit of work, strategies may stage delivery so it commits or
    /// rolls back with the enclosing operation.
    async fn deliver(
        &self,
        messages: Vec<Arc<Message>>,
        uow: Option<&UnitOfWork>,
    ) -> Result<()>;

    /// Called when the sender axis starts.
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the sender axis stops.
    async fn on_stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-level façade starting and stopping message flow to the outside
/// world.
pub struct BusController {
    state: Mutex<ControllerState>,
    strategy: Arc<dyn DeliveryStrategy>,
    client: Arc<dyn TransportClient>,
}

impl BusController {
    pub fn new(strategy: Arc<dyn DeliveryStrategy>, client: Arc<dyn TransportClient>) -> Self {
        Self {
            state: Mutex::new(ControllerState::default()),
            strategy,
            client,
        }
    }

    /// Start accepting and forwarding outbound messages.
    pub async fn start_sending(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(BusError::Disposed);
        }
        if state.sender == AxisState::Started {
            return Err(BusError::AlreadyStarted(Axis::Sender));
        }
        self.client.start().await?;
        self.strategy.on_start().await?;
        state.sender = AxisState::Started;
        info!(strategy = self.strategy.name(), "Sender started");
        Ok(())
    }

    /// Stop forwarding. No-op when already stopped.
    pub async fn stop_sending(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(BusError::Disposed);
        }
        if state.sender == AxisState::Stopped {
            debug!("Sender already stopped");
            return Ok(());
        }
        self.strategy.on_stop().await?;
        self.client.stop().await?;
        state.sender = AxisState::Stopped;
        info!("Sender stopped");
        Ok(())
    }

    /// Start accepting inbound flow.
    pub async fn start_receiving(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(BusError::Disposed);
        }
        if state.receiver == AxisState::Started {
            return Err(BusError::AlreadyStarted(Axis::Receiver));
        }
        state.receiver = AxisState::Started;
        info!("Receiver started");
        Ok(())
    }

    /// Stop accepting inbound flow. No-op when already stopped.
    pub async fn stop_receiving(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.disposed {
            return Err(BusError::Disposed);
        }
        if state.receiver == AxisState::Stopped {
            debug!("Receiver already stopped");
            return Ok(());
        }
        state.receiver = AxisState::Stopped;
        info!("Receiver stopped");
        Ok(())
    }

    /// Accept outbound messages for delivery; own atomic unit.
    pub async fn send(&self, messages: Vec<Arc<Message>>) -> Result<()> {
        self.send_inner(messages, None).await
    }

    /// Accept outbound messages staged under a unit of work, so delivery
    /// commits or rolls back with the enclosing dispatch.
    pub async fn send_enlisted(
        &self,
        messages: Vec<Arc<Message>>,
        uow: &UnitOfWork,
    ) -> Result<()> {
        self.send_inner(messages, Some(uow)).await
    }

    async fn send_inner(
        &self,
        messages: Vec<Arc<Message>>,
        uow: Option<&UnitOfWork>,
    ) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.disposed {
                return Err(BusError::Disposed);
            }
            if state.sender == AxisState::Stopped {
                return Err(BusError::NotStarted(Axis::Sender));
            }
            if state.receiver == AxisState::Stopped {
                return Err(BusError::NotStarted(Axis::Receiver));
            }
        }
        if messages.is_empty() {
            return Ok(());
        }
        debug!(count = messages.len(), strategy = self.strategy.name(), "Accepting messages");
        self.strategy.deliver(messages, uow).await
    }

    /// Tear the controller down. Terminal and idempotent.
    pub async fn dispose(&self) {
        let mut state = self.state.lock().await;
        if state.disposed {
            return;
        }
        if state.sender == AxisState::Started {
            if let Err(e) = self.strategy.on_stop().await {
                warn!(error = %e, "Strategy stop failed during dispose");
            }
            if let Err(e) = self.client.stop().await {
                warn!(error = %e, "Client stop failed during dispose");
            }
            state.sender = AxisState::Stopped;
        }
        state.receiver = AxisState::Stopped;
        state.disposed = true;
        info!("Bus controller disposed");
    }

    /// Host lifecycle entry point: start both axes.
    pub async fn start(&self, token: CancellationToken) -> Result<()> {
        if token.is_cancelled() {
            return Err(BusError::StartCancelled);
        }
        self.start_sending().await?;
        if token.is_cancelled() {
            self.stop_sending().await?;
            return Err(BusError::StartCancelled);
        }
        self.start_receiving().await
    }

    /// Host lifecycle exit point: stop both axes.
    pub async fn stop(&self) -> Result<()> {
        self.stop_receiving().await?;
        self.stop_sending().await
    }
}

/// Build a controller from configuration.
///
/// Selects the delivery strategy, and for store-and-forward opens the
/// journal-backed queue when a journal path is configured.
pub fn init_controller(
    config: &Config,
    client: Arc<dyn TransportClient>,
) -> std::result::Result<BusController, Box<dyn std::error::Error + Send + Sync>> {
    let strategy: Arc<dyn DeliveryStrategy> = match config.delivery.strategy_kind()? {
        StrategyKind::Direct => Arc::new(DirectSend::new(client.clone())),
        StrategyKind::ForwardOnly => Arc::new(ForwardOnlyQueue::new(
            client.clone(),
            config.delivery.forward_batch,
        )),
        StrategyKind::StoreAndForward => {
            let options = QueueOptions {
                default_isolation: config.queue.isolation_level()?,
                lock_timeout: config.queue.lock_timeout(),
            };
            let queue = match &config.queue.journal {
                Some(path) => TransactionalQueue::open(path, options)?,
                None => TransactionalQueue::in_memory(options),
            };
            Arc::new(StoreForwardQueue::new(
                client.clone(),
                queue,
                StoreForwardOptions {
                    batch: config.delivery.forward_batch,
                    interval: config.delivery.forward_interval(),
                    retries: config.delivery.forward_retries,
                    ..Default::default()
                },
            ))
        }
    };

    info!(strategy = strategy.name(), "Bus controller initialized");
    Ok(BusController::new(strategy, client))
}

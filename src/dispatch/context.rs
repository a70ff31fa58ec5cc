//! The context handed to every handler during a dispatch.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::operation::{Operation, OperationStack};
use crate::bus::BusController;
use crate::error::HandlerError;
use crate::message::{Message, MessageKind, MessageStream};
use crate::uow::{UnitOfWork, UowResource};

/// Per-dispatch context: the operation trace, the message bus, and
/// unit-of-work access.
pub struct DispatchContext {
    stack: Arc<OperationStack>,
    stream: Arc<Mutex<MessageStream>>,
    uow: Arc<UnitOfWork>,
    controller: Option<Arc<BusController>>,
    cancellation: CancellationToken,
}

impl DispatchContext {
    pub(crate) fn new(
        stack: Arc<OperationStack>,
        stream: Arc<Mutex<MessageStream>>,
        uow: Arc<UnitOfWork>,
        controller: Option<Arc<BusController>>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            stack,
            stream,
            uow,
            controller,
            cancellation,
        }
    }

    /// Snapshot of the dispatch ancestry, root first.
    pub fn trace(&self) -> Vec<Operation> {
        self.stack.trace()
    }

    /// The operation currently executing.
    pub fn current_operation(&self) -> Option<Operation> {
        self.stack.current()
    }

    /// The caller's cancellation token; observe it between suspension
    /// points and return `HandlerError::Cancelled` when it fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The unit of work spanning this dispatch.
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    /// Enlist a resource into the current unit of work.
    pub async fn enlist(&self, resource: Arc<dyn UowResource>) -> Result<(), HandlerError> {
        self.uow
            .enlist(resource)
            .await
            .map_err(|e| HandlerError::Other(e.to_string()))
    }

    /// Send a command onto the stream.
    pub async fn send(&self, command: Message) -> Result<(), HandlerError> {
        self.route(command.defaulted_kind(MessageKind::Command)).await
    }

    /// Publish an event onto the stream.
    pub async fn publish(&self, event: Message) -> Result<(), HandlerError> {
        self.route(event.defaulted_kind(MessageKind::Event)).await
    }

    /// Append to the stream, correlated to the message being processed;
    /// outgoing messages are forwarded to the bus controller under this
    /// dispatch's unit of work.
    async fn route(&self, message: Message) -> Result<(), HandlerError> {
        let cause = self
            .stack
            .current()
            .and_then(|op| op.message.map(|m| m.id()));
        let message = match cause {
            Some(id) => message.correlated_to(id),
            None => message,
        };
        let message = Arc::new(message);

        trace!(
            content_type = message.content_type(),
            outgoing = message.is_outgoing(),
            "Message published to stream"
        );
        self.stream
            .lock()
            .expect("message stream lock")
            .append(message.clone());

        if message.is_outgoing() {
            match &self.controller {
                Some(controller) => {
                    controller.send_enlisted(vec![message], &self.uow).await?;
                }
                None => {
                    return Err(HandlerError::Other(
                        "no bus controller configured for outgoing messages".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn stack(&self) -> &Arc<OperationStack> {
        &self.stack
    }

    pub(crate) fn stream(&self) -> &Arc<Mutex<MessageStream>> {
        &self.stream
    }

    pub(crate) fn uow(&self) -> &Arc<UnitOfWork> {
        &self.uow
    }
}

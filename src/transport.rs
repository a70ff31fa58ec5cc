//! Transport client seam.
//!
//! The bus controller's strategies delegate all network I/O to a pluggable
//! client; the core specifies only the start/stop/send lifecycle. Concrete
//! clients (AMQP, gRPC, ...) live outside this crate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;

/// Failure reported by a transport client.
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport client failed: {0}")]
pub struct ClientError(pub String);

impl ClientError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Pluggable external transport.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Bring the client up. Called when the controller's sender starts.
    async fn start(&self) -> Result<(), ClientError>;

    /// Tear the client down. Called when the controller's sender stops.
    async fn stop(&self) -> Result<(), ClientError>;

    /// Deliver a batch of messages to the external transport.
    async fn send(&self, messages: Vec<Arc<Message>>) -> Result<(), ClientError>;
}

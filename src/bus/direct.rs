//! Direct-send delivery strategy.
//!
//! Forwards every accepted batch to the transport client immediately. No
//! buffering, no durability; a client failure surfaces to the sender.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{DeliveryStrategy, Result};
use crate::message::Message;
use crate::transport::TransportClient;
use crate::uow::UnitOfWork;

pub struct DirectSend {
    client: Arc<dyn TransportClient>,
}

impl DirectSend {
    pub fn new(client: Arc<dyn TransportClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeliveryStrategy for DirectSend {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn deliver(
        &self,
        messages: Vec<Arc<Message>>,
        _uow: Option<&UnitOfWork>,
    ) -> Result<()> {
        let count = messages.len();
        self.client.send(messages).await?;
        debug!(count, "Batch forwarded directly");
        Ok(())
    }
}

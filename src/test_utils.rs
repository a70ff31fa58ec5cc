//! Test utilities and mock implementations.
//!
//! Mock transport client and simple handlers/resources for exercising the
//! dispatch, bus and unit-of-work machinery without a real transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::dispatch::DispatchContext;
use crate::error::{HandlerError, RuleViolation};
use crate::message::Message;
use crate::registry::Handler;
use crate::transport::{ClientError, TransportClient};

/// Transport client that records every sent message in memory.
#[derive(Default)]
pub struct MockTransportClient {
    sent: Mutex<Vec<Arc<Message>>>,
    started: AtomicBool,
    fail_sends: AtomicUsize,
}

impl MockTransportClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Everything sent so far, in send order.
    pub fn sent(&self) -> Vec<Arc<Message>> {
        self.sent.lock().expect("mock client lock").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("mock client lock").len()
    }
}

#[async_trait]
impl TransportClient for MockTransportClient {
    async fn start(&self) -> Result<(), ClientError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, messages: Vec<Arc<Message>>) -> Result<(), ClientError> {
        let failing = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::new("induced send failure"));
        }
        self.sent.lock().expect("mock client lock").extend(messages);
        Ok(())
    }
}

/// Handler that counts invocations and otherwise succeeds.
#[derive(Default)]
pub struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }
}

#[async_trait]
impl Handler for CountingHandler {
    async fn handle(
        &self,
        _message: Arc<Message>,
        _ctx: &DispatchContext,
    ) -> Result<(), HandlerError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handler that always raises the given business-rule violation.
pub struct FailingHandler {
    violation: RuleViolation,
}

impl FailingHandler {
    pub fn new(violation: RuleViolation) -> Self {
        Self { violation }
    }
}

#[async_trait]
impl Handler for FailingHandler {
    async fn handle(
        &self,
        _message: Arc<Message>,
        _ctx: &DispatchContext,
    ) -> Result<(), HandlerError> {
        Err(self.violation.clone().into())
    }
}

/// Handler that reports cancellation without consulting any token.
pub struct CancellingHandler;

#[async_trait]
impl Handler for CancellingHandler {
    async fn handle(
        &self,
        _message: Arc<Message>,
        _ctx: &DispatchContext,
    ) -> Result<(), HandlerError> {
        Err(HandlerError::Cancelled)
    }
}

//! Dispatch engine.
//!
//! Drives a root message through its handlers and recursively dispatches
//! every message they publish. The cascade is an explicit work-list: the
//! stream cursor hands out unprocessed messages FIFO while handlers append
//! at the tail, so deep cascades never grow the call stack and processing
//! is breadth-first by construction. The engine owns the unit of work for
//! the whole cascade and flushes it once the stream stabilizes.

mod context;
mod operation;

pub use context::DispatchContext;
pub use operation::{FrameGuard, Operation, OperationKind, OperationStack, OperationType};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::BusController;
use crate::config::Config;
use crate::error::{classify_flush, classify_handler_failure, FailureOrigin, Fault, HandlerError};
use crate::message::{Message, MessageKind, MessageStream};
use crate::registry::{HandlerProvider, ResolvedHandler};
use crate::uow::{FlushConcurrency, UnitOfWork};

/// Default deadline for query dispatches.
const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(30);

/// Outcome of a successful dispatch.
#[derive(Clone, Debug)]
pub struct DispatchReport {
    /// The root message.
    pub root: Arc<Message>,
    /// Every message published during the cascade, in processing order.
    pub stream: Vec<Arc<Message>>,
    /// Handler invocations across root and cascade.
    pub handled: usize,
    /// Messages forwarded to the bus controller.
    pub forwarded: usize,
}

/// Drives messages through handlers and owns the per-dispatch unit of
/// work.
pub struct DispatchEngine {
    registry: Arc<dyn HandlerProvider>,
    controller: Option<Arc<BusController>>,
    uow_mode: FlushConcurrency,
    query_deadline: Duration,
}

impl std::fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("controller", &self.controller.is_some())
            .field("uow_mode", &self.uow_mode)
            .field("query_deadline", &self.query_deadline)
            .finish()
    }
}

impl DispatchEngine {
    pub fn new(registry: Arc<dyn HandlerProvider>) -> Self {
        Self {
            registry,
            controller: None,
            uow_mode: FlushConcurrency::SingleThreaded,
            query_deadline: DEFAULT_QUERY_DEADLINE,
        }
    }

    /// Forward outgoing messages through a bus controller.
    pub fn with_controller(mut self, controller: Arc<BusController>) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn with_uow_mode(mut self, mode: FlushConcurrency) -> Self {
        self.uow_mode = mode;
        self
    }

    pub fn with_query_deadline(mut self, deadline: Duration) -> Self {
        self.query_deadline = deadline;
        self
    }

    /// Build an engine from configuration.
    ///
    /// Mode strings are validated here, before any handler runs; an
    /// unknown value is a fatal configuration fault.
    pub fn from_config(
        config: &Config,
        registry: Arc<dyn HandlerProvider>,
        controller: Option<Arc<BusController>>,
    ) -> Result<Self, Fault> {
        let uow_mode = config
            .unit_of_work
            .concurrency()
            .map_err(|e| Fault::Configuration(e.to_string()))?;
        config
            .queue
            .isolation_level()
            .map_err(|e| Fault::Configuration(e.to_string()))?;
        config
            .delivery
            .strategy_kind()
            .map_err(|e| Fault::Configuration(e.to_string()))?;

        Ok(Self {
            registry,
            controller,
            uow_mode,
            query_deadline: DEFAULT_QUERY_DEADLINE,
        })
    }

    /// Dispatch a message through every registered handler matching its
    /// content type (0..N, registration order).
    pub async fn dispatch(&self, message: Message) -> Result<DispatchReport, Fault> {
        self.run(message, None, CancellationToken::new()).await
    }

    /// Dispatch a message through the supplied handler only; the cascade
    /// still resolves from the registry.
    pub async fn dispatch_with(
        &self,
        message: Message,
        handler: ResolvedHandler,
    ) -> Result<DispatchReport, Fault> {
        self.run(message, Some(handler), CancellationToken::new())
            .await
    }

    /// Dispatch with a caller-owned cancellation token.
    pub async fn dispatch_cancellable(
        &self,
        message: Message,
        caller: CancellationToken,
    ) -> Result<DispatchReport, Fault> {
        self.run(message, None, caller).await
    }

    async fn run(
        &self,
        message: Message,
        only: Option<ResolvedHandler>,
        caller: CancellationToken,
    ) -> Result<DispatchReport, Fault> {
        let root = Arc::new(message);
        let stack = Arc::new(OperationStack::default());
        let stream = Arc::new(Mutex::new(MessageStream::default()));
        let uow = Arc::new(UnitOfWork::new(self.uow_mode));
        let ctx = DispatchContext::new(
            stack.clone(),
            stream.clone(),
            uow.clone(),
            self.controller.clone(),
            caller.clone(),
        );

        let root_handlers = match only {
            Some(handler) => vec![handler],
            None => self.registry.resolve(root.content_type()),
        };
        debug!(
            content_type = root.content_type(),
            handlers = root_handlers.len(),
            "Dispatching root message"
        );

        let mut handled = 0usize;
        for resolved in root_handlers {
            if caller.is_cancelled() {
                uow.rollback().await;
                return Err(Fault::Cancelled);
            }

            let frame = stack.push(Operation::handler(
                OperationKind::Root,
                root.clone(),
                &resolved.component,
            ));
            let outcome = resolved.handler.handle(root.clone(), &ctx).await;
            drop(frame);
            handled += 1;

            if let Err(error) = outcome {
                uow.rollback().await;
                return Err(classify_handler_failure(
                    FailureOrigin::Root(root.kind()),
                    &resolved.component,
                    caller.is_cancelled(),
                    error,
                ));
            }
        }

        handled += self.drain_cascade(&ctx).await?;

        uow.flush().await.map_err(classify_flush)?;

        let messages = stream
            .lock()
            .expect("message stream lock")
            .messages()
            .to_vec();
        let forwarded = messages.iter().filter(|m| m.is_outgoing()).count();
        debug!(handled, forwarded, stream = messages.len(), "Dispatch complete");

        Ok(DispatchReport {
            root,
            stream: messages,
            handled,
            forwarded,
        })
    }

    /// Drain the stream work-list until no unprocessed message remains.
    ///
    /// On failure the unit of work is rolled back and the failure
    /// classified as a cascade step.
    async fn drain_cascade(&self, ctx: &DispatchContext) -> Result<usize, Fault> {
        let caller = ctx.cancellation().clone();
        let mut handled = 0usize;
        loop {
            if caller.is_cancelled() {
                ctx.uow().rollback().await;
                return Err(Fault::Cancelled);
            }

            let next = ctx
                .stream()
                .lock()
                .expect("message stream lock")
                .next_pending();
            let Some(message) = next else { break };

            // Outgoing messages were forwarded at publication; the
            // cascade only re-dispatches internal ones.
            if message.is_outgoing() {
                continue;
            }

            let handlers = self.registry.resolve(message.content_type());
            for resolved in handlers {
                let frame = ctx.stack().push(Operation::handler(
                    OperationKind::Branch,
                    message.clone(),
                    &resolved.component,
                ));
                let outcome = resolved.handler.handle(message.clone(), ctx).await;
                drop(frame);
                handled += 1;

                if let Err(error) = outcome {
                    ctx.uow().rollback().await;
                    return Err(classify_handler_failure(
                        FailureOrigin::Cascade,
                        &resolved.component,
                        caller.is_cancelled(),
                        error,
                    ));
                }
            }
        }
        Ok(handled)
    }

    /// Run the query handler registered under `name`.
    ///
    /// `request` is `None` for parameterless queries. The whole dispatch
    /// runs under the engine's query deadline; an expired deadline or
    /// caller token is a timeout fault.
    pub async fn query(
        &self,
        name: &str,
        request: Option<Message>,
        caller: CancellationToken,
    ) -> Result<Message, Fault> {
        let Some(resolved) = self.registry.resolve_query(name) else {
            return Err(Fault::Server {
                component: name.to_string(),
                cause: Box::new(HandlerError::Other(format!(
                    "no query handler registered for '{name}'"
                ))),
            });
        };

        let request = request.map(Arc::new);
        let stack = Arc::new(OperationStack::default());
        let stream = Arc::new(Mutex::new(MessageStream::default()));
        let uow = Arc::new(UnitOfWork::new(self.uow_mode));
        let ctx = DispatchContext::new(
            stack.clone(),
            stream.clone(),
            uow.clone(),
            self.controller.clone(),
            caller.clone(),
        );

        let work = async {
            let frame = stack.push(Operation::query(request.clone(), &resolved.component));
            let outcome = resolved.handler.query(request.clone(), &ctx).await;
            drop(frame);

            let value = match outcome {
                Ok(value) => value,
                Err(error) => {
                    uow.rollback().await;
                    return Err(classify_handler_failure(
                        FailureOrigin::Query,
                        &resolved.component,
                        caller.is_cancelled(),
                        error,
                    ));
                }
            };

            self.drain_cascade(&ctx).await?;
            uow.flush().await.map_err(classify_flush)?;
            Ok(value)
        };

        // Abandoning the work future rolls staged queue transactions back
        // through their drop handlers.
        let value = tokio::select! {
            biased;
            _ = caller.cancelled() => {
                return Err(Fault::Timeout {
                    what: "caller token expired".to_string(),
                });
            }
            finished = tokio::time::timeout(self.query_deadline, work) => match finished {
                Ok(inner) => inner?,
                Err(_) => {
                    return Err(Fault::Timeout {
                        what: format!("query deadline of {:?} expired", self.query_deadline),
                    });
                }
            },
        };

        let response = match &request {
            Some(request) => Message::query_response(request, value),
            None => Message::new(MessageKind::QueryResponse, name, value),
        };
        debug!(query = name, "Query answered");
        Ok(response)
    }
}

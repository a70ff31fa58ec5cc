//! Unit-of-work engine.
//!
//! Tracks the stateful resources an operation touches and flushes them
//! when the outermost dispatch completes, per the configured concurrency
//! mode. Resources enlist at most once per scope (deduplicated by id) and
//! participate in rollback through `abort`.

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Errors raised while flushing a unit of work.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    /// One resource failed to flush.
    #[error("resource '{resource}' failed to flush: {message}")]
    Resource { resource: String, message: String },

    /// Multiple concurrent flushes failed.
    #[error("{} of {attempted} resources failed to flush", .failures.len())]
    Aggregate {
        attempted: usize,
        failures: Vec<FlushError>,
    },

    /// A flush task did not run to completion.
    #[error("flush task aborted: {0}")]
    Join(String),
}

impl FlushError {
    pub fn resource(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Resource {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// A stateful participant in a unit of work.
///
/// Lifetime is the outermost dispatch. `requires_flush` must be idempotent;
/// `flush` is invoked at most once per scope by the engine.
#[async_trait]
pub trait UowResource: Send + Sync {
    /// Stable identity; a second enlistment under the same id is ignored.
    fn id(&self) -> &str;

    /// Whether this resource has pending work to flush.
    async fn requires_flush(&self) -> bool;

    /// Flush pending work.
    async fn flush(&self) -> Result<(), FlushError>;

    /// Discard pending work because the enclosing operation failed.
    async fn abort(&self) {}
}

/// How enlisted resources are flushed at operation end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FlushConcurrency {
    /// No deferral: a resource requiring flush is flushed synchronously at
    /// enlistment.
    Disabled,
    /// Sequential flush in enlistment order; the first failure stops all
    /// subsequent flushes.
    SingleThreaded,
    /// Concurrent flush as independent tasks; one failure does not block
    /// the others, failures are aggregated.
    MultiThreaded,
}

/// The per-dispatch unit of work.
pub struct UnitOfWork {
    id: Uuid,
    mode: FlushConcurrency,
    resources: Mutex<Vec<Arc<dyn UowResource>>>,
}

impl UnitOfWork {
    pub fn new(mode: FlushConcurrency) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            resources: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn mode(&self) -> FlushConcurrency {
        self.mode
    }

    /// Enlist a resource into this scope.
    ///
    /// Idempotent per resource id. In `Disabled` mode a resource requiring
    /// flush is flushed before this call returns.
    pub async fn enlist(&self, resource: Arc<dyn UowResource>) -> Result<(), FlushError> {
        {
            let mut resources = self.resources.lock().expect("uow resources lock");
            if resources.iter().any(|r| r.id() == resource.id()) {
                debug!(uow = %self.id, resource = resource.id(), "Resource already enlisted");
                return Ok(());
            }
            resources.push(resource.clone());
        }
        debug!(uow = %self.id, resource = resource.id(), "Resource enlisted");

        if self.mode == FlushConcurrency::Disabled && resource.requires_flush().await {
            debug!(uow = %self.id, resource = resource.id(), "Flushing at enlistment");
            resource.flush().await?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Vec<Arc<dyn UowResource>> {
        self.resources.lock().expect("uow resources lock").clone()
    }

    /// Flush all enlisted resources per the configured mode.
    ///
    /// Invoked once by the dispatch engine when the outermost operation
    /// completes successfully.
    pub async fn flush(&self) -> Result<(), FlushError> {
        let resources = self.snapshot();
        match self.mode {
            // Everything requiring flush was flushed at enlistment.
            FlushConcurrency::Disabled => Ok(()),
            FlushConcurrency::SingleThreaded => {
                for resource in resources {
                    if resource.requires_flush().await {
                        resource.flush().await.inspect_err(|e| {
                            error!(uow = %self.id, resource = resource.id(), error = %e,
                                "Flush failed, skipping remaining resources");
                        })?;
                    }
                }
                Ok(())
            }
            FlushConcurrency::MultiThreaded => {
                let mut tasks = JoinSet::new();
                let mut attempted = 0usize;
                for resource in resources {
                    if resource.requires_flush().await {
                        attempted += 1;
                        tasks.spawn(async move { resource.flush().await });
                    }
                }

                let mut failures = Vec::new();
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(failure)) => failures.push(failure),
                        Err(join_err) => failures.push(FlushError::Join(join_err.to_string())),
                    }
                }

                if failures.is_empty() {
                    Ok(())
                } else {
                    error!(uow = %self.id, failed = failures.len(), attempted,
                        "Concurrent flush completed with failures");
                    Err(FlushError::Aggregate {
                        attempted,
                        failures,
                    })
                }
            }
        }
    }

    /// Tell every enlisted resource to discard staged work.
    ///
    /// Invoked when the enclosing operation fails; rollback errors are
    /// logged, not raised, so the original fault survives.
    pub async fn rollback(&self) {
        let resources = self.snapshot();
        for resource in resources.iter().rev() {
            warn!(uow = %self.id, resource = resource.id(), "Discarding staged work");
            resource.abort().await;
        }
    }
}

#[cfg(test)]
mod tests;

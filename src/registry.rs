//! Handler registry: an explicit dispatch table from content types to
//! ordered handler lists.
//!
//! Built once at startup; the dispatch engine only consumes the resolved
//! list. Registration supplies either a shared instance (singleton) or a
//! factory invoked per dispatch (transient).

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ConfigError;
use crate::dispatch::DispatchContext;
use crate::error::HandlerError;
use crate::message::Message;

/// Processes one message within a dispatch.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle the message. Publishing through the context feeds the
    /// cascade; failures use the declared channels of `HandlerError`.
    async fn handle(
        &self,
        message: Arc<Message>,
        ctx: &DispatchContext,
    ) -> Result<(), HandlerError>;
}

/// Answers one query within a dispatch.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Answer the query. `request` is `None` for parameterless queries.
    async fn query(
        &self,
        request: Option<Arc<Message>>,
        ctx: &DispatchContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Lifetime policy for registered handler types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerLifetime {
    /// One shared instance for the process lifetime.
    Singleton,
    /// A fresh instance resolved per dispatch.
    Transient,
}

impl FromStr for HandlerLifetime {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "singleton" => Ok(Self::Singleton),
            "transient" => Ok(Self::Transient),
            other => Err(ConfigError::UnknownValue {
                field: "handler lifetime",
                value: other.to_string(),
            }),
        }
    }
}

/// Factory producing transient handler instances.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn Handler> + Send + Sync>;

enum Provider {
    Singleton(Arc<dyn Handler>),
    Transient(HandlerFactory),
}

struct Registration {
    component: String,
    provider: Provider,
}

impl Registration {
    fn resolve(&self) -> ResolvedHandler {
        let handler = match &self.provider {
            Provider::Singleton(instance) => instance.clone(),
            Provider::Transient(factory) => factory(),
        };
        ResolvedHandler {
            component: self.component.clone(),
            handler,
        }
    }
}

struct QueryRegistration {
    component: String,
    handler: Arc<dyn QueryHandler>,
}

/// A handler resolved for one dispatch, with the component name used in
/// operation frames and fault reports.
#[derive(Clone)]
pub struct ResolvedHandler {
    pub component: String,
    pub handler: Arc<dyn Handler>,
}

impl ResolvedHandler {
    pub fn new(component: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        Self {
            component: component.into(),
            handler,
        }
    }
}

/// A query handler resolved for one dispatch.
#[derive(Clone)]
pub struct ResolvedQuery {
    pub component: String,
    pub handler: Arc<dyn QueryHandler>,
}

/// Supplies the ordered handler list per content type.
///
/// The dispatch engine depends on this seam only; `HandlerRegistry` is the
/// in-process implementation, a DI layer can bring its own.
pub trait HandlerProvider: Send + Sync {
    /// Ordered handlers matching a content type; empty when none match.
    fn resolve(&self, content_type: &str) -> Vec<ResolvedHandler>;

    /// The query handler registered under a name, if any.
    fn resolve_query(&self, name: &str) -> Option<ResolvedQuery>;
}

/// Dispatch table from content-type tags to ordered handler registrations.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Registration>>,
    queries: HashMap<String, QueryRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shared handler instance for a content type.
    ///
    /// Registration order per content type is execution order.
    pub fn register(
        &mut self,
        content_type: impl Into<String>,
        component: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> &mut Self {
        self.handlers
            .entry(content_type.into())
            .or_default()
            .push(Registration {
                component: component.into(),
                provider: Provider::Singleton(handler),
            });
        self
    }

    /// Register a handler factory with an explicit lifetime policy.
    pub fn register_factory(
        &mut self,
        content_type: impl Into<String>,
        component: impl Into<String>,
        lifetime: HandlerLifetime,
        factory: HandlerFactory,
    ) -> &mut Self {
        let provider = match lifetime {
            HandlerLifetime::Singleton => Provider::Singleton(factory()),
            HandlerLifetime::Transient => Provider::Transient(factory),
        };
        self.handlers
            .entry(content_type.into())
            .or_default()
            .push(Registration {
                component: component.into(),
                provider,
            });
        self
    }

    /// Register the query handler for a query name.
    ///
    /// One handler per name; a second registration replaces the first.
    pub fn register_query(
        &mut self,
        name: impl Into<String>,
        component: impl Into<String>,
        handler: Arc<dyn QueryHandler>,
    ) -> &mut Self {
        self.queries.insert(
            name.into(),
            QueryRegistration {
                component: component.into(),
                handler,
            },
        );
        self
    }
}

impl HandlerProvider for HandlerRegistry {
    fn resolve(&self, content_type: &str) -> Vec<ResolvedHandler> {
        self.handlers
            .get(content_type)
            .map(|list| list.iter().map(Registration::resolve).collect())
            .unwrap_or_default()
    }

    fn resolve_query(&self, name: &str) -> Option<ResolvedQuery> {
        self.queries.get(name).map(|reg| ResolvedQuery {
            component: reg.component.clone(),
            handler: reg.handler.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn handle(
            &self,
            _message: Arc<Message>,
            _ctx: &DispatchContext,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_resolution_preserves_registration_order() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("orders.place", "first", Arc::new(Noop))
            .register("orders.place", "second", Arc::new(Noop));

        let resolved = registry.resolve("orders.place");
        let components: Vec<_> = resolved.iter().map(|r| r.component.as_str()).collect();
        assert_eq!(components, vec!["first", "second"]);
    }

    #[test]
    fn test_unknown_content_type_resolves_empty() {
        let registry = HandlerRegistry::new();
        assert!(registry.resolve("nobody.home").is_empty());
        assert!(registry.resolve_query("nobody.home").is_none());
    }

    #[test]
    fn test_transient_factory_runs_per_resolution() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: HandlerFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Noop)
        });

        let mut registry = HandlerRegistry::new();
        registry.register_factory("orders.place", "orders", HandlerLifetime::Transient, factory);

        registry.resolve("orders.place");
        registry.resolve("orders.place");
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_singleton_factory_runs_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: HandlerFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(Noop)
        });

        let mut registry = HandlerRegistry::new();
        registry.register_factory("orders.place", "orders", HandlerLifetime::Singleton, factory);

        registry.resolve("orders.place");
        registry.resolve("orders.place");
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lifetime_parsing() {
        assert_eq!(
            "singleton".parse::<HandlerLifetime>().unwrap(),
            HandlerLifetime::Singleton
        );
        assert_eq!(
            "transient".parse::<HandlerLifetime>().unwrap(),
            HandlerLifetime::Transient
        );
        assert!("scoped".parse::<HandlerLifetime>().is_err());
    }
}

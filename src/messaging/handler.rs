use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::contracts::{DecodedEvent, HandlerError};

/// Processes one decoded event. Returning `Err` is the only way to signal a
/// failure; `HandlerError::Permanent` suppresses redrive.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError>;
}

/// Adapts an async closure into an `EventHandler`.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DecodedEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

pub type HandlerMap = HashMap<String, Arc<dyn EventHandler>>;

/// Routing key to handler table.
///
/// `register` swaps the whole table at once; readers always see either the
/// old or the new table, never a mix. Production wiring builds it once at
/// startup, tests replace it with fakes.
#[derive(Default)]
pub struct HandlerRegistry {
    table: RwLock<Arc<HandlerMap>>,
}

impl HandlerRegistry {
    pub fn new(handlers: HandlerMap) -> Self {
        Self {
            table: RwLock::new(Arc::new(handlers)),
        }
    }

    pub fn register(&self, handlers: HandlerMap) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        *table = Arc::new(handlers);
    }

    pub fn resolve(&self, routing_key: &str) -> Option<Arc<dyn EventHandler>> {
        self.snapshot().get(routing_key).cloned()
    }

    pub fn contains(&self, routing_key: &str) -> bool {
        self.snapshot().contains_key(routing_key)
    }

    /// Registered keys, sorted, used as queue bindings.
    pub fn routing_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshot().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn snapshot(&self) -> Arc<HandlerMap> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routing_keys", &self.routing_keys())
            .finish()
    }
}

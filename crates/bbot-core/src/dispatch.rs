//! Routing of events to handlers by `kind`.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{task::JoinHandle, time::timeout};

use crate::{
    config::Config,
    domain::{Event, HandlerResult},
    store::Store,
    Result,
};

/// Everything a handler may touch, constructed once per core instance.
#[derive(Clone)]
pub struct BotContext {
    pub cfg: Arc<Config>,
    pub store: Arc<dyn Store>,
}

impl BotContext {
    pub fn new(cfg: Arc<Config>, store: Arc<dyn Store>) -> Self {
        Self { cfg, store }
    }
}

/// Logic bound to one event kind.
///
/// Returning `Err` marks the event as failed; the run loop logs it and moves
/// on to the next event.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult>;
}

/// Kind -> handler table.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn Handler>>,
    handler_timeout: Duration,
}

impl Dispatcher {
    pub fn new(handler_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            handler_timeout,
        }
    }

    /// Bind `handler` to `kind`. A previous binding is replaced and returned.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        let kind = kind.into();
        let previous = self.handlers.insert(kind.clone(), handler);
        if previous.is_some() {
            tracing::warn!(kind = %kind, "handler re-registered; previous binding replaced");
        }
        previous
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Invoke the handler bound to `event.kind`.
    ///
    /// Never fails: an unknown kind is `Ignored`, and a handler error, panic or
    /// timeout becomes `Failed`. The handler runs on its own task so a panic
    /// stays contained to this event.
    pub async fn route(&self, ctx: &BotContext, event: &Event) -> HandlerResult {
        let Some(handler) = self.handlers.get(&event.kind).cloned() else {
            return HandlerResult::ignored();
        };

        let ctx = ctx.clone();
        let ev = event.clone();
        let mut task = AbortOnDrop(tokio::spawn(async move {
            handler.handle(&ctx, &ev).await
        }));

        match timeout(self.handler_timeout, &mut task.0).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => HandlerResult::failed(e.to_string()),
            Ok(Err(join)) if join.is_panic() => HandlerResult::failed("handler panicked"),
            Ok(Err(join)) => HandlerResult::failed(format!("handler task failed: {join}")),
            Err(_) => {
                HandlerResult::failed(format!(
                    "handler timed out after {}ms",
                    self.handler_timeout.as_millis()
                ))
            }
        }
    }
}

/// Cancels the handler task when routing is abandoned (timeout, drain deadline).
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

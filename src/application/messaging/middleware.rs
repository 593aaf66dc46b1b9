//! Middleware system for event dispatch
//!
//! A chain is a list of [`Middleware`] layers ending in one [`EventHandler`].
//! Each layer receives the [`Context`] and a [`Next`] continuation; calling
//! [`Next::run`] advances to the following layer, or to the handler once the
//! layers are exhausted. A layer that drops `Next` without running it ends
//! the chain and the handler never runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::application::errors::SocketError;
use crate::domain::entities::Context;
use crate::domain::traits::Payload;

/// Result of a middleware layer or a terminal handler
pub type HandlerResult = Result<(), SocketError>;

/// Middleware trait - interceptors run before the terminal handler
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Inspect or modify the context, then call `next.run(ctx)` to continue
    async fn handle(&self, ctx: Context, next: Next) -> HandlerResult;
}

/// Terminal handler for one event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn call(&self, ctx: Context, data: Payload) -> HandlerResult;
}

/// Continuation to the rest of a chain
#[derive(Clone)]
pub struct Next {
    layers: Arc<[Arc<dyn Middleware>]>,
    position: usize,
    handler: Arc<dyn EventHandler>,
}

impl Next {
    fn new(layers: Arc<[Arc<dyn Middleware>]>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            layers,
            position: 0,
            handler,
        }
    }

    /// Run the remaining layers, then the handler
    pub async fn run(self, ctx: Context) -> HandlerResult {
        let layer = self.layers.get(self.position).cloned();
        match layer {
            Some(layer) => {
                let next = Next {
                    layers: self.layers,
                    position: self.position + 1,
                    handler: self.handler,
                };
                layer.handle(ctx, next).await
            }
            None => {
                let data = ctx.data.clone();
                self.handler.call(ctx, data).await
            }
        }
    }
}

/// Composed middleware function shared by every chain built from it
#[derive(Clone)]
pub struct MiddlewareStack {
    layers: Arc<[Arc<dyn Middleware>]>,
}

impl MiddlewareStack {
    /// Compose an ordered list of layers. An empty list composes to nothing.
    pub fn compose(middleware: Vec<Arc<dyn Middleware>>) -> Option<Self> {
        if middleware.is_empty() {
            return None;
        }
        Some(Self {
            layers: middleware.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Continuation positioned at the first layer, ending in `handler`
    pub fn ending_in(&self, handler: Arc<dyn EventHandler>) -> Next {
        Next::new(Arc::clone(&self.layers), handler)
    }
}

/// One handler together with the middleware snapshot it was registered under
#[derive(Clone)]
pub struct Chain {
    stack: Option<MiddlewareStack>,
    handler: Arc<dyn EventHandler>,
}

impl Chain {
    pub fn new(stack: Option<MiddlewareStack>, handler: Arc<dyn EventHandler>) -> Self {
        Self { stack, handler }
    }

    /// Run the chain for one inbound event.
    ///
    /// Without middleware the handler is called directly.
    pub fn dispatch(&self, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        match &self.stack {
            Some(stack) => stack.ending_in(Arc::clone(&self.handler)).run(ctx).boxed(),
            None => {
                let handler = Arc::clone(&self.handler);
                let data = ctx.data.clone();
                async move { handler.call(ctx, data).await }.boxed()
            }
        }
    }
}

/// Middleware chain builder
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self {
            middlewares: Vec::new(),
        }
    }

    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn build(self) -> Vec<Arc<dyn Middleware>> {
        self.middlewares
    }
}

impl Default for MiddlewareChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Middleware built from an async closure, see [`from_fn`]
pub struct FromFn<F>(F);

/// Turn `|ctx, next| async move { ... }` into a [`Middleware`]
pub fn from_fn<F, Fut>(f: F) -> FromFn<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FromFn(f)
}

#[async_trait]
impl<F, Fut> Middleware for FromFn<F>
where
    F: Fn(Context, Next) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: Context, next: Next) -> HandlerResult {
        (self.0)(ctx, next).await
    }
}

/// Handler built from an async closure, see [`handler_fn`]
pub struct HandlerFn<F>(F);

/// Turn `|ctx, data| async move { ... }` into an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Context, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Context, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: Context, data: Payload) -> HandlerResult {
        (self.0)(ctx, data).await
    }
}

/// Rate limit middleware. Over-limit events are dropped without a reply.
pub struct RateLimitMiddleware {
    requests: Mutex<HashMap<String, Vec<Instant>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self::with_window(max_requests, Duration::from_secs(window_secs))
    }

    pub fn with_window(max_requests: u32, window: Duration) -> Self {
        Self {
            requests: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// Record one event for `key`, or report how long until the window frees up
    fn check_rate_limit(&self, key: &str) -> Option<Duration> {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Instant::now();

        // Forget events outside the window, and keys with none left
        requests.retain(|_, times| {
            times.retain(|&t| now.duration_since(t) < self.window);
            !times.is_empty()
        });

        let times = requests.entry(key.to_string()).or_default();

        if times.len() >= self.max_requests as usize {
            let retry_after = times
                .first()
                .map(|t| self.window.saturating_sub(now.duration_since(*t)))
                .unwrap_or(self.window);
            return Some(retry_after);
        }

        times.push(now);
        None
    }

    /// Number of keys with events still inside the window
    pub fn tracked_keys(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(&self, ctx: Context, next: Next) -> HandlerResult {
        let key = ctx.socket.id().unwrap_or_default();

        if let Some(retry_after) = self.check_rate_limit(&key) {
            tracing::warn!(
                "[{}] Rate limited on '{}', retry after {:?}",
                key,
                ctx.event,
                retry_after
            );
            return Ok(());
        }

        next.run(ctx).await
    }
}

/// Logging middleware for debugging
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, ctx: Context, next: Next) -> HandlerResult {
        let socket_id = ctx.socket.id().unwrap_or_else(|| "-".to_string());
        let event = ctx.event.clone();
        let preview: String = ctx.data.to_string().chars().take(50).collect();

        tracing::debug!("[{}] <- {} {}", socket_id, event, preview);

        let result = next.run(ctx).await;

        match &result {
            Ok(()) => tracing::debug!("[{}] {} done", socket_id, event),
            Err(e) => tracing::warn!("[{}] {} failed: {}", socket_id, event, e),
        }

        result
    }
}

/// Stores the receive time as RFC 3339 under `ts`
pub struct TimestampMiddleware;

impl TimestampMiddleware {
    pub const KEY: &'static str = "ts";
}

#[async_trait]
impl Middleware for TimestampMiddleware {
    async fn handle(&self, mut ctx: Context, next: Next) -> HandlerResult {
        ctx.set(Self::KEY, Utc::now().to_rfc3339());
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::messaging::SocketRef;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(event: &str, data: Payload) -> Context {
        Context::new(event, data, SocketRef::default(), None)
    }

    fn recording_handler(log: Arc<Mutex<Vec<String>>>) -> Arc<dyn EventHandler> {
        Arc::new(handler_fn(move |_ctx, data| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("handler:{}", data));
                Ok(())
            }
        }))
    }

    fn tagging(tag: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(from_fn(move |ctx, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(tag.to_string());
                next.run(ctx).await
            }
        }))
    }

    #[test]
    fn test_compose_empty_is_none() {
        assert!(MiddlewareStack::compose(Vec::new()).is_none());
        let stack = MiddlewareStack::compose(MiddlewareChain::new().add(LoggingMiddleware).build());
        assert_eq!(stack.map(|s| s.len()), Some(1));
    }

    #[tokio::test]
    async fn test_layers_run_in_order_before_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = MiddlewareStack::compose(vec![
            tagging("first", Arc::clone(&log)),
            tagging("second", Arc::clone(&log)),
        ]);
        let chain = Chain::new(stack, recording_handler(Arc::clone(&log)));

        chain.dispatch(context("chat", json!("hi"))).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first", "second", "handler:\"hi\""]
        );
    }

    #[tokio::test]
    async fn test_without_middleware_calls_handler_directly() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new(None, recording_handler(Arc::clone(&log)));

        chain.dispatch(context("chat", json!(1))).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["handler:1"]);
    }

    #[tokio::test]
    async fn test_dropping_next_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn(move |_ctx, _data| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let block: Arc<dyn Middleware> = Arc::new(from_fn(|_ctx, _next| async { Ok(()) }));
        let chain = Chain::new(MiddlewareStack::compose(vec![block]), handler);

        chain.dispatch(context("chat", json!(null))).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_middleware_error_propagates_untouched() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn(move |_ctx, _data| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let fail: Arc<dyn Middleware> = Arc::new(from_fn(|_ctx, _next| async {
            Err(SocketError::Middleware("denied".to_string()))
        }));
        let chain = Chain::new(MiddlewareStack::compose(vec![fail]), handler);

        let err = chain.dispatch(context("chat", json!(null))).await.unwrap_err();

        assert!(matches!(err, SocketError::Middleware(ref m) if m == "denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timestamp_visible_to_handler() {
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn(move |ctx, _data| {
            let slot = Arc::clone(&slot);
            async move {
                *slot.lock().unwrap() = ctx.get(TimestampMiddleware::KEY).cloned();
                Ok(())
            }
        }));
        let chain = Chain::new(
            MiddlewareStack::compose(MiddlewareChain::new().add(TimestampMiddleware).build()),
            handler,
        );

        chain.dispatch(context("chat", json!("hi"))).await.unwrap();

        let ts = seen.lock().unwrap().clone().expect("ts set");
        assert!(!ts.as_str().unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_suppresses_over_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handler: Arc<dyn EventHandler> = Arc::new(handler_fn(move |_ctx, _data| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        let chain = Chain::new(
            MiddlewareStack::compose(MiddlewareChain::new().add(RateLimitMiddleware::new(2, 60)).build()),
            handler,
        );

        for _ in 0..4 {
            chain.dispatch(context("chat", json!(null))).await.unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_rate_limit_forgets_idle_keys() {
        let limiter = RateLimitMiddleware::with_window(5, Duration::from_millis(50));

        assert_eq!(limiter.check_rate_limit("sock-a"), None);
        assert_eq!(limiter.check_rate_limit("sock-b"), None);
        assert_eq!(limiter.tracked_keys(), 2);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(limiter.check_rate_limit("sock-c"), None);

        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_rate_limit_survives_poisoned_lock() {
        let limiter = Arc::new(RateLimitMiddleware::new(1, 60));
        let poisoner = Arc::clone(&limiter);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.requests.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(limiter.requests.is_poisoned());
        assert_eq!(limiter.check_rate_limit("sock"), None);
        assert!(limiter.check_rate_limit("sock").is_some());
    }
}

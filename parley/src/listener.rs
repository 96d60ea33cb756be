//! Lifecycle events of an invocation.
//!
//! Listeners are a side channel: every method has a no-op default, they
//! cannot return errors, and a panicking listener is caught and logged.
//! Nothing a listener does changes the outcome of an invocation.
//!
//! Events, in order:
//!
//! 1. **`on_start`**: the invocation context was created
//! 2. per model call, **`on_response`**; per tool call, **`on_tool_executed`**
//! 3. **`on_complete`** with the terminal response, or **`on_error`**

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use crate::chat::ChatResponse;
use crate::error::Error;
use crate::service::InvocationContext;
use crate::tool::ToolExecution;

/// Observer of invocation lifecycle events.
#[async_trait]
pub trait InvocationListener: Send + Sync {
    /// Called once the invocation context exists, before any side effect.
    async fn on_start(&self, _ctx: &InvocationContext) {}

    /// Called after every model response, including intermediate ones.
    async fn on_response(&self, _ctx: &InvocationContext, _response: &ChatResponse) {}

    /// Called after each tool call, in request order.
    async fn on_tool_executed(&self, _ctx: &InvocationContext, _execution: &ToolExecution) {}

    /// Called when the invocation succeeds.
    async fn on_complete(&self, _ctx: &InvocationContext, _response: &ChatResponse) {}

    /// Called when the invocation fails.
    async fn on_error(&self, _ctx: &InvocationContext, _error: &Error) {}
}

/// A shared, thread-safe [`InvocationListener`] trait object.
pub type SharedInvocationListener = Arc<dyn InvocationListener>;

/// Log verbosity for [`LoggingListener`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level logging.
    Debug,
    /// Info-level logging.
    #[default]
    Info,
}

macro_rules! log_at_level {
    ($level:expr, $($arg:tt)*) => {
        match $level {
            LogLevel::Debug => tracing::debug!($($arg)*),
            LogLevel::Info => tracing::info!($($arg)*),
        }
    };
}

/// Listener that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener {
    level: LogLevel,
}

impl LoggingListener {
    /// Log at INFO.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log at `level`.
    #[must_use]
    pub const fn with_level(level: LogLevel) -> Self {
        Self { level }
    }
}

#[async_trait]
impl InvocationListener for LoggingListener {
    async fn on_start(&self, ctx: &InvocationContext) {
        log_at_level!(
            self.level,
            invocation = %ctx.id(),
            method = ctx.method(),
            memory_id = ctx.memory_id(),
            "Invocation started"
        );
    }

    async fn on_response(&self, ctx: &InvocationContext, response: &ChatResponse) {
        log_at_level!(
            self.level,
            invocation = %ctx.id(),
            stop_reason = %response.stop_reason,
            tool_calls = response.tool_calls().len(),
            "Model responded"
        );
    }

    async fn on_tool_executed(&self, ctx: &InvocationContext, execution: &ToolExecution) {
        log_at_level!(
            self.level,
            invocation = %ctx.id(),
            tool = %execution.request.name,
            failed = execution.failed,
            "Tool executed"
        );
    }

    async fn on_complete(&self, ctx: &InvocationContext, response: &ChatResponse) {
        let usage = response.usage.unwrap_or_default();
        log_at_level!(
            self.level,
            invocation = %ctx.id(),
            total_tokens = usage.total_tokens,
            "Invocation completed"
        );
    }

    async fn on_error(&self, ctx: &InvocationContext, error: &Error) {
        tracing::warn!(invocation = %ctx.id(), error = %error, "Invocation failed");
    }
}

/// Ordered set of listeners, notified one after another.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Vec<SharedInvocationListener>,
}

macro_rules! notify_all {
    ($set:expr, $event:literal, |$l:ident| $call:expr) => {
        for $l in &$set.listeners {
            if AssertUnwindSafe($call).catch_unwind().await.is_err() {
                warn!(event = $event, "Invocation listener panicked");
            }
        }
    };
}

impl ListenerSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener.
    pub fn push(&mut self, listener: SharedInvocationListener) {
        self.listeners.push(listener);
    }

    /// Number of listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Check if there are no listeners.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) async fn start(&self, ctx: &InvocationContext) {
        notify_all!(self, "start", |l| l.on_start(ctx));
    }

    pub(crate) async fn response(&self, ctx: &InvocationContext, response: &ChatResponse) {
        notify_all!(self, "response", |l| l.on_response(ctx, response));
    }

    pub(crate) async fn tool_executed(&self, ctx: &InvocationContext, execution: &ToolExecution) {
        notify_all!(self, "tool_executed", |l| l.on_tool_executed(ctx, execution));
    }

    pub(crate) async fn complete(&self, ctx: &InvocationContext, response: &ChatResponse) {
        notify_all!(self, "complete", |l| l.on_complete(ctx, response));
    }

    pub(crate) async fn error(&self, ctx: &InvocationContext, error: &Error) {
        notify_all!(self, "error", |l| l.on_error(ctx, error));
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counter {
        starts: AtomicUsize,
        errors: AtomicUsize,
    }

    #[async_trait]
    impl InvocationListener for Counter {
        async fn on_start(&self, _ctx: &InvocationContext) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_error(&self, _ctx: &InvocationContext, _error: &Error) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicky;

    #[async_trait]
    impl InvocationListener for Panicky {
        async fn on_start(&self, _ctx: &InvocationContext) {
            panic!("listener bug");
        }
    }

    #[tokio::test]
    async fn notifies_in_order_and_survives_panics() {
        let counter = Arc::new(Counter::default());
        let mut set = ListenerSet::new();
        set.push(Arc::new(Panicky));
        set.push(Arc::clone(&counter) as SharedInvocationListener);
        set.push(Arc::new(LoggingListener::with_level(LogLevel::Debug)));

        let ctx = InvocationContext::for_tests("svc", "chat");
        set.start(&ctx).await;
        set.error(&ctx, &Error::configuration("x")).await;

        assert_eq!(counter.starts.load(Ordering::SeqCst), 1);
        assert_eq!(counter.errors.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 3);
    }

    #[tokio::test]
    async fn default_methods_are_no_ops() {
        struct Quiet;

        #[async_trait]
        impl InvocationListener for Quiet {}

        let ctx = InvocationContext::for_tests("svc", "chat");
        Quiet.on_complete(&ctx, &ChatResponse::from_text("ok")).await;
    }
}

//! Streaming delivery of a method's answer.
//!
//! [`AiService::invoke_streaming`](crate::AiService::invoke_streaming)
//! returns a [`TokenStream`]. Register handlers, then call
//! [`TokenStream::start`]:
//!
//! - exactly one partial-token handler;
//! - at most one completion handler;
//! - exactly one of an error handler or [`TokenStream::ignore_errors`];
//! - at most one each of the retrieved-content, intermediate-response,
//!   before-tool-execution and tool-execution handlers.
//!
//! A violated cardinality fails in `start()` with [`Error::Configuration`]
//! before any network call. Every later failure goes to the error handler.
//!
//! When a streamed turn ends with tool calls, the intermediate-response
//! handler sees that turn, the before-tool-execution handler sees each call,
//! the tools run and a new streamed turn starts with the same handlers. Usage accumulates across
//! turns; the completion handler receives it on the final response.
//!
//! ```rust,ignore
//! let handle = service
//!     .invoke_streaming("chat", Args::new().arg("message", "Tell me a story"))?
//!     .on_partial_response(|token| print!("{token}"))
//!     .on_complete(|response| println!("\n[{} tokens]", response.usage.unwrap_or_default().total_tokens))
//!     .on_error(|err| eprintln!("failed: {err}"))
//!     .start()?;
//! handle.wait().await;
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use crate::assembler::AssembledMessages;
use crate::chat::{ChatRequest, ChatResponse};
use crate::error::{Error, LlmError, Result};
use crate::guardrail::{GuardrailContext, OutputOutcome};
use crate::retrieval::RetrievedContent;
use crate::service::{InvocationContext, Prepared, Route, ServiceInner};
use crate::stream::{StreamAggregator, StreamChunk};
use crate::message::ToolCall;
use crate::tool::{AggregateResult, ToolExecution};

type PartialHandler = Box<dyn FnMut(&str) + Send>;
type CompleteHandler = Box<dyn FnOnce(ChatResponse) + Send>;
type ErrorHandler = Box<dyn FnOnce(Error) + Send>;
type RetrievedHandler = Box<dyn FnMut(&[RetrievedContent]) + Send>;
type ToolHandler = Box<dyn FnMut(&ToolExecution) + Send>;
type IntermediateHandler = Box<dyn FnMut(&ChatResponse) + Send>;
type BeforeToolHandler = Box<dyn FnMut(&ToolCall) + Send>;

#[derive(Default)]
struct Handlers {
    partial: Vec<PartialHandler>,
    complete: Vec<CompleteHandler>,
    error: Vec<ErrorHandler>,
    ignore_errors: usize,
    retrieved: Vec<RetrievedHandler>,
    intermediate: Vec<IntermediateHandler>,
    before_tool: Vec<BeforeToolHandler>,
    tool_executed: Vec<ToolHandler>,
}

impl Handlers {
    fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::configuration(msg));
        match self.partial.len() {
            1 => {}
            0 => return fail("one partial response handler must be registered"),
            _ => return fail("only one partial response handler can be registered"),
        }
        if self.complete.len() > 1 {
            return fail("only one completion handler can be registered");
        }
        match self.error.len() + self.ignore_errors {
            1 => {}
            0 => return fail("register an error handler or call ignore_errors()"),
            _ => return fail("register exactly one of an error handler or ignore_errors()"),
        }
        if self.retrieved.len() > 1 {
            return fail("only one retrieved content handler can be registered");
        }
        if self.intermediate.len() > 1 {
            return fail("only one intermediate response handler can be registered");
        }
        if self.before_tool.len() > 1 {
            return fail("only one before tool execution handler can be registered");
        }
        if self.tool_executed.len() > 1 {
            return fail("only one tool execution handler can be registered");
        }
        Ok(())
    }

    fn into_sinks(self) -> Sinks {
        Sinks {
            partial: self.partial.into_iter().next(),
            complete: self.complete.into_iter().next(),
            error: self.error.into_iter().next(),
            retrieved: self.retrieved.into_iter().next(),
            intermediate: self.intermediate.into_iter().next(),
            before_tool: self.before_tool.into_iter().next(),
            tool_executed: self.tool_executed.into_iter().next(),
        }
    }
}

/// Validated handlers, at most one of each.
struct Sinks {
    partial: Option<PartialHandler>,
    complete: Option<CompleteHandler>,
    error: Option<ErrorHandler>,
    retrieved: Option<RetrievedHandler>,
    intermediate: Option<IntermediateHandler>,
    before_tool: Option<BeforeToolHandler>,
    tool_executed: Option<ToolHandler>,
}

/// Everything a streaming invocation needs, prepared synchronously.
pub(crate) struct StreamJob {
    pub(crate) service: Arc<ServiceInner>,
    pub(crate) route: Arc<Route>,
    pub(crate) invocation: InvocationContext,
    pub(crate) assembled: AssembledMessages,
}

/// A streaming invocation waiting for its handlers.
#[must_use = "a token stream does nothing until started"]
pub struct TokenStream {
    job: StreamJob,
    handlers: Handlers,
}

impl TokenStream {
    pub(crate) fn new(job: StreamJob) -> Self {
        Self {
            job,
            handlers: Handlers::default(),
        }
    }

    /// Receive each token as it is generated.
    pub fn on_partial_response(mut self, handler: impl FnMut(&str) + Send + 'static) -> Self {
        self.handlers.partial.push(Box::new(handler));
        self
    }

    /// Receive the final response, with usage summed over all turns.
    pub fn on_complete(mut self, handler: impl FnOnce(ChatResponse) + Send + 'static) -> Self {
        self.handlers.complete.push(Box::new(handler));
        self
    }

    /// Receive the error that ended the invocation.
    pub fn on_error(mut self, handler: impl FnOnce(Error) + Send + 'static) -> Self {
        self.handlers.error.push(Box::new(handler));
        self
    }

    /// Log errors instead of handling them.
    pub const fn ignore_errors(mut self) -> Self {
        self.handlers.ignore_errors += 1;
        self
    }

    /// Receive the content retrieved for augmentation.
    pub fn on_retrieved(mut self, handler: impl FnMut(&[RetrievedContent]) + Send + 'static) -> Self {
        self.handlers.retrieved.push(Box::new(handler));
        self
    }

    /// Receive each streamed response that requested tools, before they run.
    pub fn on_intermediate_response(mut self, handler: impl FnMut(&ChatResponse) + Send + 'static) -> Self {
        self.handlers.intermediate.push(Box::new(handler));
        self
    }

    /// Receive each tool call just before it runs.
    pub fn before_tool_execution(mut self, handler: impl FnMut(&ToolCall) + Send + 'static) -> Self {
        self.handlers.before_tool.push(Box::new(handler));
        self
    }

    /// Receive each tool execution.
    pub fn on_tool_executed(mut self, handler: impl FnMut(&ToolExecution) + Send + 'static) -> Self {
        self.handlers.tool_executed.push(Box::new(handler));
        self
    }

    /// Start streaming on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the registered handlers violate
    /// the cardinality rules. Nothing has been sent at that point.
    pub fn start(self) -> Result<StreamHandle> {
        self.handlers.validate()?;
        let sinks = self.handlers.into_sinks();
        let job = self.job;
        let signal = Arc::new(CancelSignal::default());
        let supports_cancellation = job.service.provider.supports_cancellation();
        let provider = job.service.provider.provider_name();

        let span = info_span!(
            "invocation",
            id = %job.invocation.id(),
            service = %job.invocation.service(),
            method = %job.invocation.method(),
            memory_id = %job.invocation.memory_id(),
            streaming = true,
        );
        let task = tokio::spawn(drive(job, sinks, Arc::clone(&signal)).instrument(span));

        Ok(StreamHandle {
            signal,
            supports_cancellation,
            provider,
            task: Mutex::new(Some(task)),
        })
    }
}

impl fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStream")
            .field("method", &self.job.invocation.method())
            .field("partial_handlers", &self.handlers.partial.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

/// Handle to a running streaming invocation.
#[derive(Debug)]
pub struct StreamHandle {
    signal: Arc<CancelSignal>,
    supports_cancellation: bool,
    provider: &'static str,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamHandle {
    /// Stop the invocation. A tool already running finishes; its result is
    /// dropped and nothing of that turn is stored.
    ///
    /// The flag is checked right before every callback. Called from inside a
    /// handler, or while the stream waits on the model, nothing more is
    /// delivered. Called from another thread while a token handler is already
    /// running, that one call completes and nothing follows it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancellation`] if the provider cannot stop a stream.
    pub fn cancel(&self) -> Result<()> {
        if !self.supports_cancellation {
            return Err(Error::Cancellation(format!(
                "provider '{}' does not support cancelling streams",
                self.provider
            )));
        }
        debug!("Stream cancelled");
        self.signal.cancel();
        Ok(())
    }

    /// Check whether [`cancel`](Self::cancel) succeeded.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Wait until the invocation has finished and its last callback returned.
    pub async fn wait(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Streaming task failed");
        }
    }
}

async fn drive(job: StreamJob, sinks: Sinks, signal: Arc<CancelSignal>) {
    let StreamJob {
        service,
        route,
        invocation,
        assembled,
    } = job;
    let mut sinks = sinks;
    service.listeners.start(&invocation).await;

    let outcome = Turns {
        service: &service,
        route: &route,
        invocation: &invocation,
        signal: &signal,
    }
    .run(assembled, &mut sinks)
    .await;

    match outcome {
        Ok(Some(response)) => {
            service.listeners.complete(&invocation, &response).await;
            if !signal.is_cancelled()
                && let Some(complete) = sinks.complete.take()
            {
                complete(response);
            }
        }
        Ok(None) => debug!("Stream stopped after cancellation"),
        Err(err) => {
            service.listeners.error(&invocation, &err).await;
            if signal.is_cancelled() {
                return;
            }
            match sinks.error.take() {
                Some(handler) => handler(err),
                None => warn!(error = %err, "Ignored streaming error"),
            }
        }
    }
}

/// The turn loop of one streaming invocation.
struct Turns<'a> {
    service: &'a ServiceInner,
    route: &'a Route,
    invocation: &'a InvocationContext,
    signal: &'a CancelSignal,
}

impl Turns<'_> {
    /// `Ok(None)` means the stream was cancelled.
    async fn run(&self, assembled: AssembledMessages, sinks: &mut Sinks) -> Result<Option<ChatResponse>> {
        let mut prepared = self.service.prepare(self.route, self.invocation, assembled).await?;
        if let (Some(handler), Some(augmentation)) =
            (sinks.retrieved.as_mut(), prepared.augmentation.as_ref())
        {
            handler(&augmentation.sources);
        }

        let tools = prepared.tools.take();
        let tool_loop = self
            .service
            .tool_loop(self.route, tools.as_ref().unwrap_or(&self.route.tools), self.invocation);
        let mut aggregate = AggregateResult::default();

        loop {
            if self.signal.is_cancelled() {
                return Ok(None);
            }
            let request = tool_loop
                .request_for(prepared.conversation.messages().await?)
                .streaming();
            debug!(messages = request.messages.len(), "Starting streamed turn");

            let Some(response) = self.stream_turn(&request, sinks).await? else {
                return Ok(None);
            };
            aggregate.add_usage(&response);
            self.service.listeners.response(self.invocation, &response).await;

            if !response.has_tool_calls() {
                let response = self.check_output(response, &prepared).await?;
                self.service.join_moderation(prepared.moderation.take()).await?;
                prepared.conversation.append(response.message.clone()).await?;
                return Ok(Some(response.with_usage(aggregate.usage)));
            }

            let calls = response.tool_calls().to_vec();
            tool_loop.begin_tool_turn(&mut aggregate)?;
            let immediate = tool_loop.returns_immediately(&calls)?;
            if self.signal.is_cancelled() {
                return Ok(None);
            }
            if !immediate && let Some(handler) = sinks.intermediate.as_mut() {
                handler(&response);
            }
            if let Some(handler) = sinks.before_tool.as_mut() {
                for call in &calls {
                    handler(call);
                }
            }
            let executions = tool_loop.execute(&calls).await?;
            if self.signal.is_cancelled() {
                debug!("Discarding tool results of a cancelled stream");
                return Ok(None);
            }
            if let Some(handler) = sinks.tool_executed.as_mut() {
                for execution in &executions {
                    handler(execution);
                }
            }
            prepared.conversation.append(response.message.clone()).await?;
            tool_loop
                .record(&mut prepared.conversation, &mut aggregate, executions)
                .await?;

            if immediate {
                debug!("Immediate return after streamed tool call");
                self.service.join_moderation(prepared.moderation.take()).await?;
                return Ok(Some(response.with_usage(aggregate.usage)));
            }
            aggregate.intermediate_responses.push(response);
        }
    }

    /// Stream one model turn, forwarding text tokens in order.
    async fn stream_turn(
        &self,
        request: &ChatRequest,
        sinks: &mut Sinks,
    ) -> Result<Option<ChatResponse>> {
        let mut stream = self.service.provider.chat_stream(request).await?;
        let mut aggregator = StreamAggregator::new();
        loop {
            let next = tokio::select! {
                biased;
                () = self.signal.cancelled() => return Ok(None),
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if let StreamChunk::Error { message } = &chunk {
                return Err(LlmError::stream(message.clone())
                    .for_provider(self.service.provider.provider_name())
                    .into());
            }
            if let Some(text) = chunk.as_text()
                && !text.is_empty()
            {
                if self.signal.is_cancelled() {
                    return Ok(None);
                }
                if let Some(partial) = sinks.partial.as_mut() {
                    partial(text);
                }
            }
            aggregator.apply(&chunk);
        }
        Ok(Some(aggregator.into_chat_response()))
    }

    /// Tokens are already delivered, so only pass, rewrite and reject apply.
    async fn check_output(&self, response: ChatResponse, prepared: &Prepared) -> Result<ChatResponse> {
        if !self.route.guardrails.has_output_guardrails() {
            return Ok(response);
        }
        let memory = prepared.conversation.messages().await?;
        let ctx = GuardrailContext {
            invocation: self.invocation,
            memory: &memory,
            augmentation: prepared.augmentation.as_ref(),
            variables: &prepared.variables,
        };
        match self.route.guardrails.check_output(response.clone(), &ctx, 1).await? {
            OutputOutcome::Pass(response) => Ok(response),
            OutputOutcome::Retry { guardrail, reason }
            | OutputOutcome::Reprompt {
                guardrail, reason, ..
            } => Err(Error::OutputGuardrailRejected {
                guardrail,
                reason: format!("{reason} (streamed responses cannot be retried)"),
                attempts: 1,
                last_response: Box::new(response),
            }),
        }
    }
}

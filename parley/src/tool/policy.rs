//! What the tool loop does when a call cannot be executed cleanly.

use std::fmt;
use std::sync::Arc;

use crate::error::ToolError;
use crate::message::ToolCall;
use crate::service::InvocationContext;

/// How to answer a tool call naming a tool that is not registered.
#[derive(Clone, Default)]
pub enum HallucinatedToolStrategy {
    /// Feed a tool result explaining the mismatch back to the model.
    #[default]
    ReportToModel,
    /// Abort the invocation with [`Error::ToolExecution`](crate::Error::ToolExecution).
    Error,
    /// Build the tool result text with a custom function.
    Custom(Arc<dyn Fn(&ToolCall) -> String + Send + Sync>),
}

impl fmt::Debug for HallucinatedToolStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReportToModel => f.write_str("ReportToModel"),
            Self::Error => f.write_str("Error"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Decision taken by a [`ToolErrorHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolErrorOutcome {
    /// Abort the invocation with the tool error.
    Abort,
    /// Use this text as the tool result and let the model react.
    Reply(String),
}

/// Data available to a tool error handler.
#[derive(Debug, Clone, Copy)]
pub struct ToolErrorContext<'a> {
    /// The failed call.
    pub call: &'a ToolCall,
    /// The running invocation.
    pub invocation: &'a InvocationContext,
}

/// Routes a tool error to abort or model-visible text.
pub trait ToolErrorHandler: Send + Sync {
    /// Decide what to do with `error`.
    fn handle(&self, error: &ToolError, ctx: ToolErrorContext<'_>) -> ToolErrorOutcome;
}

impl<F> ToolErrorHandler for F
where
    F: Fn(&ToolError, ToolErrorContext<'_>) -> ToolErrorOutcome + Send + Sync,
{
    fn handle(&self, error: &ToolError, ctx: ToolErrorContext<'_>) -> ToolErrorOutcome {
        self(error, ctx)
    }
}

/// Handler that always aborts. Default for argument errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnError;

impl ToolErrorHandler for AbortOnError {
    fn handle(&self, _error: &ToolError, _ctx: ToolErrorContext<'_>) -> ToolErrorOutcome {
        ToolErrorOutcome::Abort
    }
}

/// Handler that replies with the error text. Default for execution errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyWithError;

impl ToolErrorHandler for ReplyWithError {
    fn handle(&self, error: &ToolError, _ctx: ToolErrorContext<'_>) -> ToolErrorOutcome {
        ToolErrorOutcome::Reply(error.message().to_owned())
    }
}

/// Per-service policy for failing tool calls.
#[derive(Clone)]
pub struct ToolPolicy {
    /// What to do with unknown tool names.
    pub hallucinated: HallucinatedToolStrategy,
    /// Message template for [`HallucinatedToolStrategy::ReportToModel`]; `{name}` is replaced.
    pub hallucinated_message: String,
    /// Handler for argument binding failures.
    pub on_arguments_error: Arc<dyn ToolErrorHandler>,
    /// Handler for execution failures.
    pub on_execution_error: Arc<dyn ToolErrorHandler>,
}

impl ToolPolicy {
    /// Text fed back to the model for an unknown tool.
    #[must_use]
    pub fn hallucination_reply(&self, call: &ToolCall) -> Option<String> {
        match &self.hallucinated {
            HallucinatedToolStrategy::ReportToModel => {
                Some(self.hallucinated_message.replace("{name}", &call.name))
            }
            HallucinatedToolStrategy::Custom(f) => Some(f(call)),
            HallucinatedToolStrategy::Error => None,
        }
    }

    /// Pick the handler for `error`.
    #[must_use]
    pub fn handler_for(&self, error: &ToolError) -> &dyn ToolErrorHandler {
        match error {
            ToolError::Arguments(_) => self.on_arguments_error.as_ref(),
            ToolError::Execution(_) => self.on_execution_error.as_ref(),
        }
    }
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            hallucinated: HallucinatedToolStrategy::default(),
            hallucinated_message: crate::config::DEFAULT_HALLUCINATED_TOOL_MESSAGE.to_owned(),
            on_arguments_error: Arc::new(AbortOnError),
            on_execution_error: Arc::new(ReplyWithError),
        }
    }
}

impl fmt::Debug for ToolPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolPolicy")
            .field("hallucinated", &self.hallucinated)
            .field("hallucinated_message", &self.hallucinated_message)
            .finish_non_exhaustive()
    }
}

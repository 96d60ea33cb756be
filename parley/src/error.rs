//! Error types for AI service invocations.
//!
//! The taxonomy follows the life of one call:
//! - configuration and template errors, raised before anything leaves the process
//! - guardrail and moderation outcomes
//! - tool errors, which are routed through the service's tool error policy
//! - transport errors from the model executor, propagated untouched

use std::fmt;

use crate::chat::ChatResponse;

/// Result type alias for parley operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The main error type returned by AI service invocations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The service, a descriptor, or the call arguments are malformed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A template variable could not be resolved or the user text is ambiguous.
    #[error("Message template error: {0}")]
    MessageTemplate(String),

    /// The moderation model flagged the request.
    #[error("Content was flagged by moderation: {flagged_text}")]
    ModerationFlagged {
        /// The text that triggered moderation.
        flagged_text: String,
    },

    /// An input guardrail rejected the user message.
    #[error("Input guardrail '{guardrail}' rejected the request: {reason}")]
    InputGuardrailRejected {
        /// Name of the rejecting guardrail.
        guardrail: String,
        /// Reason given by the guardrail.
        reason: String,
    },

    /// An output guardrail rejected the response and no retries are left.
    #[error("Output guardrail '{guardrail}' rejected the response after {attempts} attempt(s): {reason}")]
    OutputGuardrailRejected {
        /// Name of the rejecting guardrail.
        guardrail: String,
        /// Reason given by the guardrail.
        reason: String,
        /// Number of model responses evaluated.
        attempts: usize,
        /// The last response the guardrail saw.
        last_response: Box<ChatResponse>,
    },

    /// A tool rejected its arguments and the policy chose to abort.
    #[error("Tool '{tool}' received invalid arguments: {message}")]
    ToolArguments {
        /// Tool name.
        tool: String,
        /// Error text from the tool.
        message: String,
    },

    /// A tool failed and the policy chose to abort.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution {
        /// Tool name.
        tool: String,
        /// Error text from the tool.
        message: String,
    },

    /// The model kept requesting tools beyond the configured bound.
    #[error("Exceeded {max_turns} sequential tool invocations")]
    ToolLoopExceeded {
        /// The configured bound.
        max_turns: usize,
    },

    /// Opaque failure from the model executor, including timeouts.
    #[error("Transport error: {0}")]
    Transport(#[from] LlmError),

    /// Cancellation was requested on a handle whose provider cannot honor it.
    #[error("Cancellation not supported: {0}")]
    Cancellation(String),

    /// The chat memory store failed.
    #[error("Chat memory error: {0}")]
    Memory(String),

    /// The response text could not be parsed into the declared return shape.
    #[error("Failed to parse model output: {0}")]
    OutputParsing(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a message template error.
    #[must_use]
    pub fn template(msg: impl Into<String>) -> Self {
        Self::MessageTemplate(msg.into())
    }

    /// Create a chat memory error.
    #[must_use]
    pub fn memory(msg: impl Into<String>) -> Self {
        Self::Memory(msg.into())
    }

    /// Create a tool loop error.
    #[must_use]
    pub const fn tool_loop_exceeded(max_turns: usize) -> Self {
        Self::ToolLoopExceeded { max_turns }
    }

    /// Whether the error was raised before any model or tool side effect.
    #[must_use]
    pub const fn is_pre_flight(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::MessageTemplate(_))
    }
}

/// Error type for model executor operations.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct LlmError {
    /// The error kind.
    pub kind: LlmErrorKind,
    /// The provider name (e.g., "openai", "mock").
    pub provider: Option<String>,
    /// Additional error message.
    pub message: String,
    /// Optional error code from the provider.
    pub code: Option<String>,
}

/// Categories of model executor errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum LlmErrorKind {
    /// Authentication or authorization failure.
    Auth,
    /// Rate limit exceeded.
    RateLimited,
    /// The request did not complete in time.
    Timeout,
    /// Network or connection error.
    Network,
    /// Streaming error.
    Stream,
    /// Provider-specific error.
    Provider,
    /// Feature not supported.
    NotSupported,
}

impl LlmError {
    const fn with_kind(kind: LlmErrorKind, message: String) -> Self {
        Self {
            kind,
            provider: None,
            message,
            code: None,
        }
    }

    /// Create an authentication error.
    #[must_use]
    pub fn auth(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(LlmErrorKind::Auth, message.into()).for_provider(provider)
    }

    /// Create a rate limit error.
    #[must_use]
    pub fn rate_limited(provider: impl Into<String>) -> Self {
        Self::with_kind(
            LlmErrorKind::RateLimited,
            "Rate limit exceeded. Please retry after some time.".into(),
        )
        .for_provider(provider)
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_kind(LlmErrorKind::Timeout, message.into())
    }

    /// Create a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::with_kind(LlmErrorKind::Network, message.into())
    }

    /// Create a streaming error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::with_kind(LlmErrorKind::Stream, message.into())
    }

    /// Create a provider-specific error.
    #[must_use]
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(LlmErrorKind::Provider, message.into()).for_provider(provider)
    }

    /// Create a not supported error.
    #[must_use]
    pub fn not_supported(feature: impl Into<String>) -> Self {
        Self::with_kind(
            LlmErrorKind::NotSupported,
            format!("Feature not supported: {}", feature.into()),
        )
    }

    /// Attach the provider name.
    #[must_use]
    pub fn for_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Attach a provider error code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Check if a caller-level retry might succeed.
    ///
    /// The orchestrator itself never retries transport failures.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            LlmErrorKind::RateLimited | LlmErrorKind::Network | LlmErrorKind::Timeout
        )
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(provider) = &self.provider {
            write!(f, "[{provider}] ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {code})")?;
        }
        Ok(())
    }
}

impl std::error::Error for LlmError {}

/// Error raised by a tool executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ToolError {
    /// The arguments could not be bound to the tool's parameters.
    #[error("Invalid arguments: {0}")]
    Arguments(String),

    /// The tool ran and failed.
    #[error("Execution error: {0}")]
    Execution(String),
}

impl ToolError {
    /// Create an argument binding error.
    #[must_use]
    pub fn arguments(msg: impl Into<String>) -> Self {
        Self::Arguments(msg.into())
    }

    /// Create an execution error.
    #[must_use]
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// The bare error text, without the category prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Arguments(msg) | Self::Execution(msg) => msg,
        }
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Arguments(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod error {
        use super::*;

        #[test]
        fn configuration_is_pre_flight() {
            let err = Error::configuration("two user messages");
            assert!(err.is_pre_flight());
            assert!(err.to_string().contains("two user messages"));
        }

        #[test]
        fn template_is_pre_flight() {
            assert!(Error::template("missing {{x}}").is_pre_flight());
        }

        #[test]
        fn tool_loop_is_not_pre_flight() {
            let err = Error::tool_loop_exceeded(3);
            assert!(!err.is_pre_flight());
            assert!(err.to_string().contains('3'));
        }

        #[test]
        fn from_llm_error() {
            let err: Error = LlmError::timeout("deadline").into();
            assert!(matches!(err, Error::Transport(_)));
        }

        #[test]
        fn from_json_error() {
            let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }

        #[test]
        fn output_rejection_keeps_last_response() {
            let err = Error::OutputGuardrailRejected {
                guardrail: "no_pii".into(),
                reason: "contains email".into(),
                attempts: 3,
                last_response: Box::new(ChatResponse::from_text("mail me at a@b.c")),
            };
            let Error::OutputGuardrailRejected { last_response, .. } = &err else {
                panic!("expected output rejection");
            };
            assert_eq!(last_response.text().as_deref(), Some("mail me at a@b.c"));
            assert!(err.to_string().contains("no_pii"));
        }
    }

    mod llm_error {
        use super::*;

        #[test]
        fn auth_records_provider() {
            let err = LlmError::auth("openai", "Invalid API key");
            assert_eq!(err.kind, LlmErrorKind::Auth);
            assert_eq!(err.provider.as_deref(), Some("openai"));
            assert!(err.code.is_none());
        }

        #[test]
        fn retryable_kinds() {
            assert!(LlmError::rate_limited("openai").is_retryable());
            assert!(LlmError::network("reset").is_retryable());
            assert!(LlmError::timeout("slow").is_retryable());
            assert!(!LlmError::auth("openai", "bad key").is_retryable());
            assert!(!LlmError::not_supported("streaming").is_retryable());
        }

        #[test]
        fn display_with_provider_and_code() {
            let err = LlmError::provider("ollama", "model not found").with_code("404");
            let s = err.to_string();
            assert!(s.contains("[ollama]"));
            assert!(s.contains("(code: 404)"));
        }

        #[test]
        fn display_without_provider() {
            let s = LlmError::network("timeout").to_string();
            assert!(!s.contains('['));
            assert!(s.contains("timeout"));
        }
    }

    mod tool_error {
        use super::*;

        #[test]
        fn message_strips_prefix() {
            assert_eq!(ToolError::execution("disk full").message(), "disk full");
            assert_eq!(ToolError::arguments("missing a").message(), "missing a");
        }

        #[test]
        fn from_serde_json_error() {
            let json_err = serde_json::from_str::<i32>("invalid").unwrap_err();
            let err: ToolError = json_err.into();
            assert!(matches!(err, ToolError::Arguments(_)));
        }
    }
}

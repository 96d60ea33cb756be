//! Chat request/response types and the model executor trait.
//!
//! This module provides:
//! - [`ChatRequest`]: what the orchestrator sends to the model
//! - [`ChatResponse`]: one complete model turn
//! - [`ChatProvider`]: the model executor, blocking and streaming
//!
//! # Example
//!
//! ```rust,ignore
//! use parley::prelude::*;
//!
//! let request = ChatRequest::new("gpt-4o")
//!     .message(Message::system("You are helpful."))
//!     .message(Message::user("Hello!"))
//!     .temperature(0.2);
//!
//! let response = provider.chat(&request).await?;
//! println!("{}", response.text().unwrap_or_default());
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LlmError, Result};
use crate::message::{Message, ToolCall};
use crate::stream::{ChatStream, StopReason};
use crate::tool::ToolSpecification;
use crate::usage::Usage;

/// A chat completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier (e.g., "gpt-4o").
    #[serde(default)]
    pub model: String,

    /// Conversation messages.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpecification>,

    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Native structured-output format, when the provider supports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,

    /// Whether the response is streamed.
    #[serde(default)]
    pub stream: bool,
}

impl ChatRequest {
    /// Creates a new request for `model`.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Creates a request with a full message list.
    #[must_use]
    pub fn with_messages(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::new(model)
        }
    }

    /// Appends a message.
    #[must_use]
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Sets the tools the model may call.
    #[must_use]
    pub fn tools(mut self, tools: Vec<ToolSpecification>) -> Self {
        self.tools = tools;
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the maximum tokens to generate.
    #[must_use]
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Sets the response format.
    #[must_use]
    pub fn response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    /// Marks the request as streamed.
    #[must_use]
    pub const fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Native response format for providers with structured-output support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Plain text response.
    Text,
    /// JSON response constrained by a schema.
    JsonSchema {
        /// Schema name.
        name: String,
        /// JSON Schema definition.
        schema: Value,
    },
}

/// A complete model turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated message.
    pub message: Message,

    /// Why the model stopped generating.
    #[serde(default)]
    pub stop_reason: StopReason,

    /// Token usage statistics.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    /// Model identifier used for this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Unique completion id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ChatResponse {
    /// Creates a new response with a message.
    #[must_use]
    pub const fn new(message: Message) -> Self {
        Self {
            message,
            stop_reason: StopReason::Stop,
            usage: None,
            model: None,
            id: None,
        }
    }

    /// Creates a response from text content.
    #[must_use]
    pub fn from_text(content: impl Into<String>) -> Self {
        Self::new(Message::assistant(content))
    }

    /// Creates a response requesting tool calls.
    #[must_use]
    pub fn from_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self::new(Message::assistant_tool_calls(None, tool_calls))
            .with_stop_reason(StopReason::ToolCalls)
    }

    /// Sets the stop reason.
    #[must_use]
    pub const fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = reason;
        self
    }

    /// Sets usage statistics.
    #[must_use]
    pub const fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Sets the model identifier.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Returns the text content of the response.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        self.message.text()
    }

    /// Returns `true` if the response requests tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.message.has_tool_calls()
    }

    /// Returns the requested tool calls, in request order.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.message.tool_calls
    }
}

/// The model executor.
///
/// Implementations own transport concerns (timeouts, retries on the wire,
/// authentication). The orchestrator treats every failure as opaque.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Send a request and receive a complete response.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    /// Send a request and receive a stream of chunks.
    ///
    /// By default this returns an error indicating streaming is not supported.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        let _ = request;
        Err(LlmError::not_supported("streaming")
            .for_provider(self.provider_name())
            .into())
    }

    /// Name of this provider, used in logs and errors.
    fn provider_name(&self) -> &'static str;

    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;

    /// Check if this provider supports streaming.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Check if this provider honors [`ResponseFormat::JsonSchema`].
    ///
    /// When `false`, format instructions are appended to the user message instead.
    fn supports_structured_output(&self) -> bool {
        false
    }

    /// Check if dropping an in-flight stream stops generation on the provider side.
    fn supports_cancellation(&self) -> bool {
        true
    }
}

/// Type alias for an Arc-wrapped [`ChatProvider`].
pub type SharedChatProvider = Arc<dyn ChatProvider>;

/// Rewrites every outgoing request; receives the invocation's memory id.
pub type ChatRequestTransformer = Arc<dyn Fn(ChatRequest, &str) -> ChatRequest + Send + Sync>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod request {
        use super::*;

        #[test]
        fn builder_sets_fields() {
            let request = ChatRequest::new("m")
                .message(Message::user("hi"))
                .temperature(0.5)
                .max_tokens(64)
                .streaming();
            assert_eq!(request.model, "m");
            assert_eq!(request.messages.len(), 1);
            assert_eq!(request.temperature, Some(0.5));
            assert_eq!(request.max_tokens, Some(64));
            assert!(request.stream);
        }

        #[test]
        fn serde_skips_empty_tools() {
            let json = serde_json::to_value(ChatRequest::new("m")).unwrap();
            assert!(json.get("tools").is_none());
            assert!(json.get("response_format").is_none());
        }
    }

    mod response {
        use super::*;

        #[test]
        fn from_tool_calls_marks_stop_reason() {
            let response = ChatResponse::from_tool_calls(vec![ToolCall::new("1", "sum", "{}")]);
            assert!(response.has_tool_calls());
            assert_eq!(response.stop_reason, StopReason::ToolCalls);
            assert!(response.text().is_none());
        }

        #[test]
        fn from_text_has_no_tool_calls() {
            let response = ChatResponse::from_text("done").with_usage(Usage::new(1, 1));
            assert!(!response.has_tool_calls());
            assert!(response.tool_calls().is_empty());
            assert_eq!(response.usage.unwrap().total_tokens, 2);
        }
    }
}

//! A scripted model executor for tests.
//!
//! [`MockChatProvider`] replays a queue of turns and records every request
//! it receives, so tests can assert on the exact traffic an invocation
//! produced.
//!
//! ```rust,ignore
//! let provider = Arc::new(
//!     MockChatProvider::new()
//!         .respond(ChatResponse::from_tool_calls(vec![ToolCall::new("c1", "sum", r#"{"a":2,"b":2}"#)]))
//!         .respond_text("2 + 2 = 4"),
//! );
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;

use crate::chat::{ChatProvider, ChatRequest, ChatResponse};
use crate::error::{LlmError, Result};
use crate::message::ToolCall;
use crate::stream::{ChatStream, StreamAggregator, StreamChunk};
use crate::usage::Usage;

#[derive(Debug, Clone)]
enum Turn {
    Response(ChatResponse),
    Chunks(Vec<StreamChunk>),
    Fail(LlmError),
}

/// Model executor that plays back scripted turns.
#[derive(Debug)]
pub struct MockChatProvider {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<ChatRequest>>,
    model: String,
    chunk_delay: Option<Duration>,
    streaming: bool,
    structured_output: bool,
    cancellation: bool,
}

impl Default for MockChatProvider {
    fn default() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            model: "mock-model".to_owned(),
            chunk_delay: None,
            streaming: true,
            structured_output: false,
            cancellation: true,
        }
    }
}

impl MockChatProvider {
    /// An empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a complete response.
    #[must_use]
    pub fn respond(mut self, response: ChatResponse) -> Self {
        self.turns.get_mut().push_back(Turn::Response(response));
        self
    }

    /// Queue a text response.
    #[must_use]
    pub fn respond_text(self, text: impl Into<String>) -> Self {
        self.respond(ChatResponse::from_text(text))
    }

    /// Queue a response requesting tool calls.
    #[must_use]
    pub fn respond_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.respond(ChatResponse::from_tool_calls(calls))
    }

    /// Queue raw stream chunks.
    #[must_use]
    pub fn stream(mut self, chunks: Vec<StreamChunk>) -> Self {
        self.turns.get_mut().push_back(Turn::Chunks(chunks));
        self
    }

    /// Queue a transport failure.
    #[must_use]
    pub fn fail(mut self, error: LlmError) -> Self {
        self.turns.get_mut().push_back(Turn::Fail(error));
        self
    }

    /// Attach the same usage to every queued complete response.
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        for turn in self.turns.get_mut().iter_mut() {
            if let Turn::Response(response) = turn {
                response.usage = Some(usage);
            }
        }
        self
    }

    /// Sleep before each streamed chunk.
    #[must_use]
    pub const fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    /// Report native structured-output support.
    #[must_use]
    pub const fn with_structured_output(mut self) -> Self {
        self.structured_output = true;
        self
    }

    /// Report that streams cannot be cancelled.
    #[must_use]
    pub const fn without_cancellation(mut self) -> Self {
        self.cancellation = false;
        self
    }

    /// Report no streaming support.
    #[must_use]
    pub const fn without_streaming(mut self) -> Self {
        self.streaming = false;
        self
    }

    /// Every request received so far.
    pub async fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().await.clone()
    }

    /// Number of requests received so far.
    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }

    /// Number of turns not yet played.
    pub async fn remaining(&self) -> usize {
        self.turns.lock().await.len()
    }

    async fn next_turn(&self, request: &ChatRequest) -> Result<Turn> {
        self.requests.lock().await.push(request.clone());
        self.turns.lock().await.pop_front().ok_or_else(|| {
            LlmError::provider(self.provider_name(), "no scripted turn left").into()
        })
    }

    fn chunks_for(response: ChatResponse) -> Vec<StreamChunk> {
        let mut chunks: Vec<StreamChunk> = response
            .text()
            .unwrap_or_default()
            .split_inclusive(' ')
            .map(StreamChunk::text)
            .collect();
        for (index, call) in response.tool_calls().iter().enumerate() {
            chunks.push(StreamChunk::tool_use_start(index, &call.id, &call.name));
            chunks.push(StreamChunk::tool_use_delta(index, &call.arguments));
        }
        if let Some(usage) = response.usage {
            chunks.push(StreamChunk::Usage(usage));
        }
        chunks.push(StreamChunk::done(Some(response.stop_reason)));
        chunks
    }
}

#[async_trait]
impl ChatProvider for MockChatProvider {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        match self.next_turn(request).await? {
            Turn::Response(response) => Ok(response.with_model(&self.model)),
            Turn::Chunks(chunks) => {
                let mut aggregator = StreamAggregator::new();
                for chunk in &chunks {
                    aggregator.apply(chunk);
                }
                Ok(aggregator.into_chat_response().with_model(&self.model))
            }
            Turn::Fail(error) => Err(error.into()),
        }
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<ChatStream> {
        if !self.streaming {
            return Err(LlmError::not_supported("streaming")
                .for_provider(self.provider_name())
                .into());
        }
        let chunks = match self.next_turn(request).await? {
            Turn::Response(response) => Self::chunks_for(response),
            Turn::Chunks(chunks) => chunks,
            Turn::Fail(error) => return Err(error.into()),
        };
        let delay = self.chunk_delay;
        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        });
        Ok(Box::pin(stream))
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    fn supports_structured_output(&self) -> bool {
        self.structured_output
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellation
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stream::StopReason;

    #[tokio::test]
    async fn plays_turns_in_order() {
        let provider = MockChatProvider::new().respond_text("one").respond_text("two");
        let request = ChatRequest::new("m");
        assert_eq!(provider.chat(&request).await.unwrap().text().as_deref(), Some("one"));
        assert_eq!(provider.chat(&request).await.unwrap().text().as_deref(), Some("two"));
        assert!(provider.chat(&request).await.is_err());
        assert_eq!(provider.call_count().await, 3);
    }

    #[tokio::test]
    async fn streams_responses_word_by_word() {
        let provider = MockChatProvider::new().respond_text("hello big world");
        let mut stream = provider.chat_stream(&ChatRequest::new("m")).await.unwrap();
        let mut texts = Vec::new();
        while let Some(chunk) = stream.next().await {
            if let Some(text) = chunk.unwrap().as_text() {
                texts.push(text.to_owned());
            }
        }
        assert_eq!(texts, ["hello ", "big ", "world"]);
    }

    #[tokio::test]
    async fn chunks_aggregate_for_blocking_calls() {
        let provider = MockChatProvider::new().stream(vec![
            StreamChunk::tool_use_start(0, "c1", "sum"),
            StreamChunk::tool_use_delta(0, r#"{"a":1,"#),
            StreamChunk::tool_use_delta(0, r#""b":2}"#),
        ]);
        let response = provider.chat(&ChatRequest::new("m")).await.unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolCalls);
        assert_eq!(response.tool_calls()[0].arguments, r#"{"a":1,"b":2}"#);
    }

    #[tokio::test]
    async fn scripted_failure() {
        let provider = MockChatProvider::new().fail(LlmError::timeout("slow"));
        let err = provider.chat(&ChatRequest::new("m")).await.unwrap_err();
        assert!(matches!(err, crate::Error::Transport(e) if e.is_retryable()));
    }
}

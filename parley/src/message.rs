//! Message types exchanged with the model and stored in chat memory.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Model output, possibly carrying tool calls.
    Assistant,
    /// Result of a tool call, fed back to the model.
    Tool,
}

impl Role {
    /// Get the string representation of the role.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image referenced by URL (http(s) or data URL).
    Image {
        /// The image location.
        url: String,
        /// Detail level hint: "low", "high", or "auto".
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// A base64 encoded document, e.g. a PDF.
    Document {
        /// Base64 payload.
        data: String,
        /// MIME type of the payload.
        media_type: String,
    },
}

impl Content {
    /// Create a text block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image block from a URL.
    #[must_use]
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image {
            url: url.into(),
            detail: None,
        }
    }

    /// Create a document block.
    #[must_use]
    pub fn document(data: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self::Document {
            data: data.into(),
            media_type: media_type.into(),
        }
    }

    /// Get the text if this is a text block.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text { text }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool result.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parse the raw arguments as JSON.
    ///
    /// Empty arguments parse as an empty object.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::Arguments`] if the model produced malformed JSON.
    pub fn parse_arguments(&self) -> Result<Value, ToolError> {
        if self.arguments.trim().is_empty() {
            return Ok(Value::Object(serde_json::Map::new()));
        }
        Ok(serde_json::from_str(&self.arguments)?)
    }
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,

    /// Ordered content blocks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Content>,

    /// Optional participant name (user name, tool name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Tool calls requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Id of the tool call a tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a message with a role and content blocks.
    #[must_use]
    pub const fn new(role: Role, content: Vec<Content>) -> Self {
        Self {
            role,
            content,
            name: None,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Create a system message.
    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Content::text(text)])
    }

    /// Create a user message from text.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Content::text(text)])
    }

    /// Create a user message from content blocks.
    #[must_use]
    pub const fn user_content(content: Vec<Content>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message from text.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Content::text(text)])
    }

    /// Create an assistant message carrying tool calls.
    #[must_use]
    pub fn assistant_tool_calls(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        let content = text
            .filter(|t| !t.is_empty())
            .map(Content::text)
            .into_iter()
            .collect();
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// Create a tool result message answering `call`.
    #[must_use]
    pub fn tool_result(call: &ToolCall, result: impl Into<String>) -> Self {
        Self {
            name: Some(call.name.clone()),
            tool_call_id: Some(call.id.clone()),
            ..Self::new(Role::Tool, vec![Content::text(result)])
        }
    }

    /// Set the participant name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Concatenated text of all text blocks, `None` if there are none.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self.content.iter().filter_map(Content::as_text).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Check whether the message requests tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Append `suffix` to the trailing text block, creating one if the last
    /// block is not text. Block order is never changed.
    pub fn append_text(&mut self, suffix: &str) {
        if let Some(Content::Text { text }) = self.content.last_mut() {
            text.push_str(suffix);
        } else {
            self.content.push(Content::text(suffix.trim_start()));
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::new(Role::Assistant, Vec::new())
    }
}

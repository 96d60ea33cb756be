//! Content moderation of outgoing requests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Message, Role};

/// Verdict of a moderation model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Moderation {
    /// Whether any message violates the content policy.
    pub flagged: bool,
    /// The offending text, when flagged.
    pub flagged_text: Option<String>,
}

impl Moderation {
    /// Content passed.
    #[must_use]
    pub const fn pass() -> Self {
        Self {
            flagged: false,
            flagged_text: None,
        }
    }

    /// Content was flagged.
    #[must_use]
    pub fn flagged(text: impl Into<String>) -> Self {
        Self {
            flagged: true,
            flagged_text: Some(text.into()),
        }
    }
}

/// A model that checks messages against a content policy.
#[async_trait]
pub trait ModerationModel: Send + Sync {
    /// Moderate `messages`.
    async fn moderate(&self, messages: &[Message]) -> Result<Moderation>;
}

/// A shared, thread-safe [`ModerationModel`] trait object.
pub type SharedModerationModel = Arc<dyn ModerationModel>;

/// The messages submitted for moderation: everything but tool results.
#[must_use]
pub fn moderation_input(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| m.role != Role::Tool)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    #[test]
    fn tool_results_are_not_moderated() {
        let call = ToolCall::new("c1", "sum", "{}");
        let messages = vec![
            Message::user("hi"),
            Message::assistant_tool_calls(None, vec![call.clone()]),
            Message::tool_result(&call, "4"),
        ];
        let input = moderation_input(&messages);
        assert_eq!(input.len(), 2);
        assert!(input.iter().all(|m| m.role != Role::Tool));
    }

    #[test]
    fn constructors() {
        assert!(!Moderation::pass().flagged);
        let flagged = Moderation::flagged("bad words");
        assert!(flagged.flagged);
        assert_eq!(flagged.flagged_text.as_deref(), Some("bad words"));
    }
}

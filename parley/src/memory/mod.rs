//! Chat memory: conversation history keyed by memory id.
//!
//! The orchestrator only appends and reads. History is removed only by an
//! explicit [`ChatMemoryStore::clear`].
//!
//! # Concurrency
//!
//! There is no per-memory-id locking. Running two invocations against the
//! same memory id at the same time interleaves their messages in an
//! undefined order; callers must serialize calls per conversation.

mod in_memory;

pub use in_memory::InMemoryChatMemoryStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Message, Role};

/// Storage for conversation history.
///
/// Implementations must keep at most one system message per memory id: an
/// identical system message is not stored twice, and a different one
/// replaces the old one at the head of the history. [`merge_system_message`]
/// implements that rule over a `Vec<Message>`.
#[async_trait]
pub trait ChatMemoryStore: Send + Sync {
    /// Append a message to the conversation.
    async fn append(&self, memory_id: &str, message: Message) -> Result<()>;

    /// Read the whole conversation, oldest first.
    async fn read(&self, memory_id: &str) -> Result<Vec<Message>>;

    /// Remove the conversation.
    async fn clear(&self, memory_id: &str) -> Result<()>;
}

/// A shared, thread-safe [`ChatMemoryStore`] trait object.
pub type SharedChatMemoryStore = Arc<dyn ChatMemoryStore>;

/// Append `message` to `history`, keeping at most one system message.
pub fn merge_system_message(history: &mut Vec<Message>, message: Message) {
    if message.role != Role::System {
        history.push(message);
        return;
    }
    if let Some(pos) = history.iter().position(|m| m.role == Role::System) {
        if history[pos] == message {
            return;
        }
        history.remove(pos);
    }
    history.insert(0, message);
}

/// The message history of one invocation.
///
/// Backed by a store when the service has one, otherwise by a local buffer
/// that lives as long as the invocation.
pub(crate) struct Conversation {
    store: Option<SharedChatMemoryStore>,
    memory_id: String,
    local: Vec<Message>,
}

impl Conversation {
    pub(crate) fn new(store: Option<SharedChatMemoryStore>, memory_id: impl Into<String>) -> Self {
        Self {
            store,
            memory_id: memory_id.into(),
            local: Vec::new(),
        }
    }

    pub(crate) fn memory_id(&self) -> &str {
        &self.memory_id
    }

    pub(crate) async fn append(&mut self, message: Message) -> Result<()> {
        match &self.store {
            Some(store) => store.append(&self.memory_id, message).await,
            None => {
                merge_system_message(&mut self.local, message);
                Ok(())
            }
        }
    }

    pub(crate) async fn messages(&self) -> Result<Vec<Message>> {
        match &self.store {
            Some(store) => store.read(&self.memory_id).await,
            None => Ok(self.local.clone()),
        }
    }
}

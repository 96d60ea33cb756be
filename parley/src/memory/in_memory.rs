//! In-memory chat memory store.
//!
//! [`InMemoryChatMemoryStore`] keeps every conversation in a `HashMap`
//! behind a `tokio::sync::RwLock`. Data is lost when the value is dropped.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ChatMemoryStore, merge_system_message};
use crate::error::Result;
use crate::message::Message;

/// Process-local [`ChatMemoryStore`].
#[derive(Debug, Default)]
pub struct InMemoryChatMemoryStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryChatMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of conversations with at least one message.
    pub async fn conversation_count(&self) -> usize {
        self.conversations
            .read()
            .await
            .values()
            .filter(|m| !m.is_empty())
            .count()
    }
}

#[async_trait]
impl ChatMemoryStore for InMemoryChatMemoryStore {
    async fn append(&self, memory_id: &str, message: Message) -> Result<()> {
        let mut guard = self.conversations.write().await;
        merge_system_message(guard.entry(memory_id.to_owned()).or_default(), message);
        Ok(())
    }

    async fn read(&self, memory_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .conversations
            .read()
            .await
            .get(memory_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, memory_id: &str) -> Result<()> {
        self.conversations.write().await.remove(memory_id);
        Ok(())
    }
}

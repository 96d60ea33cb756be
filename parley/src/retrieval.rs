//! Retrieval augmentation of the user message.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;
use crate::service::InvocationContext;

/// One piece of retrieved context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContent {
    /// The retrieved text.
    pub text: String,
    /// Source metadata (document id, score, and so on).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl RetrievedContent {
    /// Content with no metadata.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Input to a [`RetrievalAugmentor`].
#[derive(Debug, Clone, Copy)]
pub struct AugmentationRequest<'a> {
    /// The assembled user message.
    pub message: &'a Message,
    /// The running invocation.
    pub invocation: &'a InvocationContext,
}

/// Output of a [`RetrievalAugmentor`].
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentationResult {
    /// The user message to send instead of the assembled one.
    pub message: Message,
    /// What was retrieved.
    pub sources: Vec<RetrievedContent>,
}

impl AugmentationResult {
    /// Result that leaves the message untouched.
    #[must_use]
    pub const fn unchanged(message: Message) -> Self {
        Self {
            message,
            sources: Vec::new(),
        }
    }
}

/// Enriches the user message with retrieved context.
#[async_trait]
pub trait RetrievalAugmentor: Send + Sync {
    /// Augment the user message.
    async fn augment(&self, request: AugmentationRequest<'_>) -> Result<AugmentationResult>;
}

/// A shared, thread-safe [`RetrievalAugmentor`] trait object.
pub type SharedRetrievalAugmentor = Arc<dyn RetrievalAugmentor>;

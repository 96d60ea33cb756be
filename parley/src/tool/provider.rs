//! Tools resolved per invocation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{SharedToolExecutor, ToolSpecification};
use crate::error::Result;
use crate::message::Message;
use crate::service::InvocationContext;

/// What a [`ToolProvider`] sees.
#[derive(Debug, Clone, Copy)]
pub struct ToolProviderRequest<'a> {
    /// The running invocation.
    pub invocation: &'a InvocationContext,
    /// The user message after augmentation and input guardrails.
    pub user_message: &'a Message,
}

/// Tools added to one invocation.
#[derive(Default)]
pub struct ToolProviderResult {
    /// Specification and executor per tool.
    pub tools: Vec<(ToolSpecification, SharedToolExecutor)>,
    /// Names that end the loop right after they run.
    pub immediate_return: Vec<String>,
}

impl ToolProviderResult {
    /// An empty result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool.
    #[must_use]
    pub fn tool(mut self, specification: ToolSpecification, executor: SharedToolExecutor) -> Self {
        self.tools.push((specification, executor));
        self
    }

    /// Add an immediate-return tool.
    #[must_use]
    pub fn immediate_return_tool(self, specification: ToolSpecification, executor: SharedToolExecutor) -> Self {
        let name = specification.name.clone();
        let mut result = self.tool(specification, executor);
        result.immediate_return.push(name);
        result
    }
}

impl fmt::Debug for ToolProviderResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tools.iter().map(|(s, _)| s.name.as_str()).collect();
        f.debug_struct("ToolProviderResult")
            .field("tools", &names)
            .field("immediate_return", &self.immediate_return)
            .finish()
    }
}

/// Supplies extra tools for each invocation, next to the static registry.
///
/// Provided tools are offered on every method. A provided name that clashes
/// with a registered tool fails the invocation with
/// [`Error::Configuration`](crate::Error::Configuration).
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// Tools for this invocation.
    async fn provide_tools(&self, request: ToolProviderRequest<'_>) -> Result<ToolProviderResult>;
}

/// A shared, thread-safe [`ToolProvider`] trait object.
pub type SharedToolProvider = Arc<dyn ToolProvider>;

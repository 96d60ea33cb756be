//! Tools the model can call during an invocation.
//!
//! A tool is a [`ToolSpecification`] advertised to the model plus a
//! [`ToolExecutor`] that runs it. Typed tools implement [`Tool`] and get a
//! [`ToolExecutor`] for free; ad hoc tools can use [`FnTool`].
//!
//! # Example
//!
//! ```rust,ignore
//! #[derive(Deserialize, JsonSchema)]
//! struct SumArgs { a: i64, b: i64 }
//!
//! struct Sum;
//!
//! #[async_trait]
//! impl Tool for Sum {
//!     const NAME: &'static str = "sum";
//!     type Args = SumArgs;
//!     type Output = i64;
//!
//!     fn description(&self) -> String { "Adds two integers".into() }
//!     fn parameters_schema(&self) -> Value { parameters_for::<SumArgs>() }
//!
//!     async fn call(&self, args: SumArgs) -> Result<i64, ToolError> {
//!         Ok(args.a + args.b)
//!     }
//! }
//! ```

mod engine;
mod policy;
mod provider;

pub use engine::{AggregateResult, LoopOutcome};
pub(crate) use engine::ToolLoop;
pub use policy::{
    AbortOnError, HallucinatedToolStrategy, ReplyWithError, ToolErrorContext, ToolErrorHandler,
    ToolErrorOutcome, ToolPolicy,
};
pub use provider::{SharedToolProvider, ToolProvider, ToolProviderRequest, ToolProviderResult};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result, ToolError};
use crate::message::ToolCall;
use crate::output::generate_json_schema;

/// Description of a tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpecification {
    /// Name of the tool, unique per service.
    pub name: String,
    /// What the tool does, for the model's benefit.
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
}

impl ToolSpecification {
    /// Create a new tool specification.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Generate a parameter schema from an argument type.
#[must_use]
pub fn parameters_for<T: schemars::JsonSchema>() -> Value {
    generate_json_schema::<T>().1
}

/// Executes one tool call.
///
/// The memory id of the running invocation is passed along so tools can
/// scope state per conversation.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run `call` and return the text fed back to the model.
    async fn execute(&self, call: &ToolCall, memory_id: &str) -> Result<String, ToolError>;
}

/// A shared, thread-safe [`ToolExecutor`] trait object.
pub type SharedToolExecutor = Arc<dyn ToolExecutor>;

/// A tool with typed arguments and output.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Static name of the tool.
    const NAME: &'static str;

    /// Arguments type, decoded from the model's JSON.
    type Args: DeserializeOwned + Send;

    /// Output type, encoded back to text for the model.
    type Output: Serialize + Send;

    /// Get the description of the tool.
    fn description(&self) -> String;

    /// Get the JSON schema for the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool.
    async fn call(&self, args: Self::Args) -> Result<Self::Output, ToolError>;

    /// Get the specification advertised to the model.
    fn specification(&self) -> ToolSpecification {
        ToolSpecification::new(Self::NAME, self.description(), self.parameters_schema())
    }
}

#[async_trait]
impl<T: Tool + 'static> ToolExecutor for T {
    async fn execute(&self, call: &ToolCall, _memory_id: &str) -> Result<String, ToolError> {
        let args: T::Args = serde_json::from_value(call.parse_arguments()?)?;
        let output = self.call(args).await?;
        match serde_json::to_value(output) {
            Ok(Value::String(text)) => Ok(text),
            Ok(value) => Ok(value.to_string()),
            Err(e) => Err(ToolError::execution(e.to_string())),
        }
    }
}

/// A tool backed by a closure over the parsed JSON arguments.
pub struct FnTool<F> {
    specification: ToolSpecification,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<String, ToolError> + Send + Sync,
{
    /// Create a closure-backed tool.
    #[must_use]
    pub const fn new(specification: ToolSpecification, func: F) -> Self {
        Self {
            specification,
            func,
        }
    }

    /// The specification advertised to the model.
    #[must_use]
    pub const fn specification(&self) -> &ToolSpecification {
        &self.specification
    }
}

impl<F> fmt::Debug for FnTool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.specification.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> ToolExecutor for FnTool<F>
where
    F: Fn(Value) -> Result<String, ToolError> + Send + Sync,
{
    async fn execute(&self, call: &ToolCall, _memory_id: &str) -> Result<String, ToolError> {
        (self.func)(call.parse_arguments()?)
    }
}

/// Immutable record of one executed tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolExecution {
    /// The call as requested by the model.
    pub request: ToolCall,
    /// The text fed back to the model.
    pub result: String,
    /// Whether `result` describes a failure (handled error or unknown tool).
    pub failed: bool,
}

impl ToolExecution {
    /// Record a successful execution.
    #[must_use]
    pub const fn success(request: ToolCall, result: String) -> Self {
        Self {
            request,
            result,
            failed: false,
        }
    }

    /// Record a failure that was converted into model-visible text.
    #[must_use]
    pub const fn failure(request: ToolCall, result: String) -> Self {
        Self {
            request,
            result,
            failed: true,
        }
    }
}

#[derive(Clone)]
struct RegisteredTool {
    specification: ToolSpecification,
    executor: SharedToolExecutor,
    immediate_return: bool,
}

/// Static map from tool name to specification and executor.
///
/// Registration order is kept so the model always sees tools in the same order.
/// Clones share the executors.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed tool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the name is already taken.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        let specification = tool.specification();
        self.register_executor(specification, Arc::new(tool))
    }

    /// Register an executor under a specification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the name is already taken or empty.
    pub fn register_executor(
        &mut self,
        specification: ToolSpecification,
        executor: SharedToolExecutor,
    ) -> Result<()> {
        if specification.name.trim().is_empty() {
            return Err(Error::configuration("tool name must not be empty"));
        }
        if self.index.contains_key(&specification.name) {
            return Err(Error::configuration(format!(
                "duplicate tool name '{}'",
                specification.name
            )));
        }
        self.index
            .insert(specification.name.clone(), self.tools.len());
        self.tools.push(RegisteredTool {
            specification,
            executor,
            immediate_return: false,
        });
        Ok(())
    }

    /// Mark a registered tool as immediate-return.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if no such tool is registered.
    pub fn set_immediate_return(&mut self, name: &str) -> Result<()> {
        let idx = self
            .index
            .get(name)
            .copied()
            .ok_or_else(|| Error::configuration(format!("unknown immediate-return tool '{name}'")))?;
        self.tools[idx].immediate_return = true;
        Ok(())
    }

    /// A registry holding only the tools named in `filter`, or all of them.
    #[must_use]
    pub fn scoped(&self, filter: Option<&[String]>) -> Self {
        let mut scoped = Self::new();
        for tool in &self.tools {
            if filter.is_none_or(|names| names.contains(&tool.specification.name)) {
                scoped
                    .index
                    .insert(tool.specification.name.clone(), scoped.tools.len());
                scoped.tools.push(tool.clone());
            }
        }
        scoped
    }

    /// Add the tools of a [`ToolProviderResult`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a provided name is already taken
    /// or an immediate-return name was not provided.
    pub fn extend_with(&mut self, provided: ToolProviderResult) -> Result<()> {
        for (specification, executor) in provided.tools {
            self.register_executor(specification, executor)?;
        }
        for name in &provided.immediate_return {
            self.set_immediate_return(name)?;
        }
        Ok(())
    }

    /// Names of the immediate-return tools, in registration order.
    pub fn immediate_return_tools(&self) -> impl Iterator<Item = &str> {
        self.tools
            .iter()
            .filter(|t| t.immediate_return)
            .map(|t| t.specification.name.as_str())
    }

    /// Get the executor for `name`.
    #[must_use]
    pub fn executor(&self, name: &str) -> Option<&SharedToolExecutor> {
        self.index.get(name).map(|&idx| &self.tools[idx].executor)
    }

    /// Check whether `name` terminates the loop right after execution.
    #[must_use]
    pub fn is_immediate_return(&self, name: &str) -> bool {
        self.index
            .get(name)
            .is_some_and(|&idx| self.tools[idx].immediate_return)
    }

    /// Check if a tool with `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All specifications, or only those named in `filter`.
    #[must_use]
    pub fn specifications(&self, filter: Option<&[String]>) -> Vec<ToolSpecification> {
        self.tools
            .iter()
            .filter(|t| filter.is_none_or(|names| names.contains(&t.specification.name)))
            .map(|t| t.specification.clone())
            .collect()
    }

    /// Get the number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self
            .tools
            .iter()
            .map(|t| t.specification.name.as_str())
            .collect();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .finish()
    }
}

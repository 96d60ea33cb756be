//! Service-wide settings.
//!
//! [`ServiceConfig`] can be built in code or loaded from TOML:
//!
//! ```toml
//! max_tool_turns = 20
//! concurrent_tools = true
//! worker_pool_size = 4
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tool result fed to the model for an unknown tool; `{name}` is replaced.
pub const DEFAULT_HALLUCINATED_TOOL_MESSAGE: &str = "Error: there is no tool called '{name}'";

/// Memory id used when a method has no memory id parameter.
pub const DEFAULT_MEMORY_ID: &str = "default";

/// Tunables shared by every method of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Maximum number of model turns that request tools.
    pub max_tool_turns: usize,
    /// Maximum output guardrail retries and reprompts per invocation.
    pub max_output_guardrail_retries: usize,
    /// Run the tool calls of one turn concurrently.
    pub concurrent_tools: bool,
    /// Size of the default worker pool.
    pub worker_pool_size: usize,
    /// Memory id for methods without a memory id parameter.
    pub default_memory_id: String,
    /// Tool result for unknown tools; `{name}` is replaced with the tool name.
    pub hallucinated_tool_message: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_tool_turns: 100,
            max_output_guardrail_retries: 2,
            concurrent_tools: false,
            worker_pool_size: 8,
            default_memory_id: DEFAULT_MEMORY_ID.to_owned(),
            hallucinated_tool_message: DEFAULT_HALLUCINATED_TOOL_MESSAGE.to_owned(),
        }
    }
}

impl ServiceConfig {
    /// Parse a config from TOML. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on malformed TOML, unknown keys, or
    /// invalid values.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| Error::configuration(format!("invalid service config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a zero turn bound, an empty
    /// worker pool, or a blank default memory id.
    pub fn validate(&self) -> Result<()> {
        if self.max_tool_turns == 0 {
            return Err(Error::configuration("max_tool_turns must be at least 1"));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::configuration("worker_pool_size must be at least 1"));
        }
        if self.default_memory_id.trim().is_empty() {
            return Err(Error::configuration("default_memory_id must not be blank"));
        }
        Ok(())
    }
}

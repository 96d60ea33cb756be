//! Per-call arguments and the invocation context.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::template::TemplateValue;

/// Arguments of one method call.
///
/// Values are keyed by parameter name. Invocation parameters are a
/// free-form bag passed through to guardrails, tools and listeners.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: HashMap<String, TemplateValue>,
    parameters: BTreeMap<String, Value>,
}

impl Args {
    /// No arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the parameter `name`.
    #[must_use]
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Add a free-form invocation parameter.
    #[must_use]
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// The value bound to `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.values.get(name)
    }

    /// Check whether `name` is bound.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Names of all bound parameters.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Invocation parameters.
    #[must_use]
    pub const fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }
}

impl<K, V> FromIterator<(K, V)> for Args
where
    K: Into<String>,
    V: Into<TemplateValue>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |args, (k, v)| args.arg(k, v))
    }
}

/// Immutable record of one call.
///
/// Created by the dispatcher before any side effect and shared by
/// reference for the rest of the call.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    id: Uuid,
    service: String,
    method: String,
    args: Args,
    memory_id: String,
    timestamp: DateTime<Utc>,
}

impl InvocationContext {
    pub(crate) fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        args: Args,
        memory_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: service.into(),
            method: method.into(),
            args,
            memory_id: memory_id.into(),
            timestamp: Utc::now(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(service: &str, method: &str) -> Self {
        Self::new(service, method, Args::new(), crate::config::DEFAULT_MEMORY_ID)
    }

    /// Unique id of this call.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Name of the method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Call arguments.
    #[must_use]
    pub const fn args(&self) -> &Args {
        &self.args
    }

    /// Resolved memory id.
    #[must_use]
    pub fn memory_id(&self) -> &str {
        &self.memory_id
    }

    /// When the call was made.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Free-form invocation parameters.
    #[must_use]
    pub const fn parameters(&self) -> &BTreeMap<String, Value> {
        self.args.parameters()
    }
}

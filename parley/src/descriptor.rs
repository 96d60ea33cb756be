//! Static, validated metadata for service methods.
//!
//! A [`Descriptor`] says how one method turns its arguments into messages
//! and what it returns. Descriptors are built once, validated once, and
//! shared by every call through a [`DescriptorTable`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::guardrail::{InputGuardrail, OutputGuardrail};
use crate::output::OutputSchema;
use crate::template::PromptTemplate;

/// The placeholder bound to a method's single unannotated parameter.
pub const IT: &str = "it";

/// How a parameter contributes to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamRole {
    /// Binds a template variable of the given name.
    Variable(String),
    /// Supplies the user message text when no user template is declared.
    UserMessage,
    /// Selects the conversation memory.
    MemoryId,
    /// Names the user in the user message.
    UserName,
    /// Multimodal content appended to the user message.
    Content,
    /// No annotation. Allowed only as a method's sole parameter, where it
    /// binds `{{it}}` or becomes the user message.
    Unannotated,
}

/// A declared method parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    /// Argument name used at call sites.
    pub name: String,
    /// What the argument is for.
    pub role: ParamRole,
}

impl ParamSpec {
    /// A parameter binding the template variable of the same name.
    #[must_use]
    pub fn variable(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            role: ParamRole::Variable(name.clone()),
            name,
        }
    }

    /// A parameter binding the template variable `variable`.
    #[must_use]
    pub fn variable_as(name: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: ParamRole::Variable(variable.into()),
        }
    }

    /// A parameter carrying the user message.
    #[must_use]
    pub fn user_message(name: impl Into<String>) -> Self {
        Self::with_role(name, ParamRole::UserMessage)
    }

    /// A parameter selecting the memory id.
    #[must_use]
    pub fn memory_id(name: impl Into<String>) -> Self {
        Self::with_role(name, ParamRole::MemoryId)
    }

    /// A parameter naming the user.
    #[must_use]
    pub fn user_name(name: impl Into<String>) -> Self {
        Self::with_role(name, ParamRole::UserName)
    }

    /// A parameter carrying multimodal content.
    #[must_use]
    pub fn content(name: impl Into<String>) -> Self {
        Self::with_role(name, ParamRole::Content)
    }

    /// An unannotated parameter.
    #[must_use]
    pub fn unannotated(name: impl Into<String>) -> Self {
        Self::with_role(name, ParamRole::Unannotated)
    }

    fn with_role(name: impl Into<String>, role: ParamRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

/// What a method returns.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnShape {
    /// The response text.
    Text,
    /// The full assistant message.
    Message,
    /// A value parsed against a schema.
    Structured(OutputSchema),
    /// Content with usage, sources and tool executions.
    Result(Box<ReturnShape>),
    /// A live token stream.
    Stream,
    /// Nothing.
    Unit,
}

impl ReturnShape {
    /// Wrap a shape in [`ReturnShape::Result`].
    #[must_use]
    pub fn result(inner: Self) -> Self {
        Self::Result(Box::new(inner))
    }

    /// Check if this is a streaming shape.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream)
    }

    /// Check whether a raw tool result can stand in for the answer.
    ///
    /// Only [`ReturnShape::Result`] and streams carry it to the caller.
    #[must_use]
    pub const fn allows_immediate_return(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Stream)
    }

    /// The schema the response must follow, looking through `Result`.
    #[must_use]
    pub fn structured_schema(&self) -> Option<&OutputSchema> {
        match self {
            Self::Structured(schema) => Some(schema),
            Self::Result(inner) => inner.structured_schema(),
            _ => None,
        }
    }

    /// Check that the shape can be produced.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for nested results, results of
    /// streams, and invalid schemas.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Result(inner) => match inner.as_ref() {
                Self::Result(_) | Self::Stream => Err(Error::configuration(format!(
                    "unsupported return shape {self}"
                ))),
                other => other.validate(),
            },
            Self::Structured(schema) => schema.validate(),
            Self::Text | Self::Message | Self::Stream | Self::Unit => Ok(()),
        }
    }
}

impl fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => f.write_str("Text"),
            Self::Message => f.write_str("Message"),
            Self::Structured(schema) => write!(f, "Structured<{}>", schema.name()),
            Self::Result(inner) => write!(f, "Result<{inner}>"),
            Self::Stream => f.write_str("Stream"),
            Self::Unit => f.write_str("Unit"),
        }
    }
}

/// Resolved metadata for one service method.
#[derive(Debug, Clone)]
pub struct Descriptor {
    name: String,
    system_template: Option<PromptTemplate>,
    user_template: Option<PromptTemplate>,
    params: Vec<ParamSpec>,
    return_shape: ReturnShape,
    tools: Option<Vec<String>>,
    moderate: bool,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
}

impl Descriptor {
    /// Start describing a method.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            name: name.into(),
            system: None,
            user: None,
            params: Vec::new(),
            return_shape: ReturnShape::Text,
            tools: None,
            moderate: false,
            temperature: None,
            max_tokens: None,
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
        }
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// System prompt template.
    #[must_use]
    pub const fn system_template(&self) -> Option<&PromptTemplate> {
        self.system_template.as_ref()
    }

    /// User prompt template.
    #[must_use]
    pub const fn user_template(&self) -> Option<&PromptTemplate> {
        self.user_template.as_ref()
    }

    /// Declared parameters, in order.
    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// Declared return shape.
    #[must_use]
    pub const fn return_shape(&self) -> &ReturnShape {
        &self.return_shape
    }

    /// Names of the tools offered to the model; `None` offers all service tools.
    #[must_use]
    pub fn tools(&self) -> Option<&[String]> {
        self.tools.as_deref()
    }

    /// Whether requests are moderated.
    #[must_use]
    pub const fn moderate(&self) -> bool {
        self.moderate
    }

    /// Sampling temperature override.
    #[must_use]
    pub const fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    /// Max tokens override.
    #[must_use]
    pub const fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    /// Method-level input guardrails, run after the service-level ones.
    #[must_use]
    pub fn input_guardrails(&self) -> &[InputGuardrail] {
        &self.input_guardrails
    }

    /// Method-level output guardrails, run after the service-level ones.
    #[must_use]
    pub fn output_guardrails(&self) -> &[OutputGuardrail] {
        &self.output_guardrails
    }

    /// The parameter with `role`, if declared.
    #[must_use]
    pub fn param_with_role(&self, role: &ParamRole) -> Option<&ParamSpec> {
        self.params.iter().find(|p| &p.role == role)
    }

    fn templates(&self) -> impl Iterator<Item = &PromptTemplate> {
        self.system_template.iter().chain(self.user_template.iter())
    }

    /// Check the descriptor on its own.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::configuration(format!("method '{}': {msg}", self.name)));

        if self.name.trim().is_empty() {
            return Err(Error::configuration("method name must not be empty"));
        }
        self.return_shape.validate()?;

        let mut seen = HashSet::new();
        for p in &self.params {
            if !seen.insert(p.name.as_str()) {
                return fail(format!("duplicate parameter '{}'", p.name));
            }
        }

        for role in [ParamRole::UserMessage, ParamRole::MemoryId, ParamRole::UserName] {
            if self.params.iter().filter(|p| p.role == role).count() > 1 {
                return fail(format!("more than one {role:?} parameter"));
            }
        }

        let unannotated = self
            .params
            .iter()
            .filter(|p| p.role == ParamRole::Unannotated)
            .count();
        if unannotated > 0 && self.params.len() > 1 {
            return fail(
                "with more than one parameter, every parameter must declare a role".into(),
            );
        }

        let user_param = self.param_with_role(&ParamRole::UserMessage).is_some();
        if self.user_template.is_some() && user_param {
            return fail("declares both a user template and a user message parameter".into());
        }
        let has_content = self.params.iter().any(|p| p.role == ParamRole::Content);
        if self.user_template.is_none() && !user_param && unannotated == 0 && !has_content {
            return fail("no user template and no parameter supplies the user message".into());
        }

        if self.templates().any(|t| t.references(IT)) && unannotated != 1 {
            return fail(format!(
                "templates reference {{{{{IT}}}}} but the method does not have exactly one unannotated parameter"
            ));
        }

        let mut variables = HashSet::new();
        for p in &self.params {
            if let ParamRole::Variable(var) = &p.role
                && !variables.insert(var.as_str())
            {
                return fail(format!("template variable '{var}' is bound twice"));
            }
        }

        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return fail(format!("temperature {t} is out of range"));
        }
        Ok(())
    }
}

/// Builder for [`Descriptor`].
#[derive(Debug)]
#[must_use]
pub struct DescriptorBuilder {
    name: String,
    system: Option<String>,
    user: Option<String>,
    params: Vec<ParamSpec>,
    return_shape: ReturnShape,
    tools: Option<Vec<String>>,
    moderate: bool,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
}

impl DescriptorBuilder {
    /// Set the system prompt template.
    pub fn system(mut self, template: impl Into<String>) -> Self {
        self.system = Some(template.into());
        self
    }

    /// Set the user prompt template.
    pub fn user(mut self, template: impl Into<String>) -> Self {
        self.user = Some(template.into());
        self
    }

    /// Declare the next parameter.
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Set the return shape (default: [`ReturnShape::Text`]).
    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.return_shape = shape;
        self
    }

    /// Restrict the tools offered to the model.
    pub fn tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Moderate requests to this method.
    pub const fn moderate(mut self) -> Self {
        self.moderate = true;
        self
    }

    /// Override the sampling temperature.
    pub const fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Override max tokens.
    pub const fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Add a method-level input guardrail.
    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    /// Add a method-level output guardrail.
    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    /// Parse the templates and validate the result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a template is blank or the
    /// descriptor is malformed.
    pub fn build(self) -> Result<Descriptor> {
        let descriptor = Descriptor {
            name: self.name,
            system_template: self.system.map(PromptTemplate::parse).transpose()?,
            user_template: self.user.map(PromptTemplate::parse).transpose()?,
            params: self.params,
            return_shape: self.return_shape,
            tools: self.tools,
            moderate: self.moderate,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            input_guardrails: self.input_guardrails,
            output_guardrails: self.output_guardrails,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Validated, immutable map from method name to descriptor.
#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    descriptors: HashMap<String, Arc<Descriptor>>,
}

impl DescriptorTable {
    /// Build a table, rejecting duplicate method names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on duplicates or invalid descriptors.
    pub fn new(descriptors: impl IntoIterator<Item = Descriptor>) -> Result<Self> {
        let mut table = HashMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            let name = descriptor.name.clone();
            if table.insert(name.clone(), Arc::new(descriptor)).is_some() {
                return Err(Error::configuration(format!("duplicate method '{name}'")));
            }
        }
        Ok(Self { descriptors: table })
    }

    /// Look up a method.
    #[must_use]
    pub fn get(&self, method: &str) -> Option<&Arc<Descriptor>> {
        self.descriptors.get(method)
    }

    /// Iterate over all descriptors.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Descriptor>> {
        self.descriptors.values()
    }

    /// Number of methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Check if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn err_text(result: Result<Descriptor>) -> String {
        match result {
            Err(Error::Configuration(msg)) => msg,
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    mod descriptor {
        use super::*;

        #[test]
        fn translate_is_valid() {
            let d = Descriptor::builder("translate")
                .user("Translate to {{language}}: {{text}}")
                .param(ParamSpec::variable("language"))
                .param(ParamSpec::variable("text"))
                .build()
                .unwrap();
            assert_eq!(d.params().len(), 2);
            assert_eq!(d.return_shape(), &ReturnShape::Text);
        }

        #[test]
        fn single_unannotated_is_user_message() {
            Descriptor::builder("chat")
                .param(ParamSpec::unannotated("message"))
                .build()
                .unwrap();
        }

        #[test]
        fn needs_a_user_message_source() {
            let msg = err_text(
                Descriptor::builder("chat")
                    .param(ParamSpec::memory_id("id"))
                    .build(),
            );
            assert!(msg.contains("no user template"));
        }

        #[test]
        fn multiple_params_must_declare_roles() {
            let msg = err_text(
                Descriptor::builder("chat")
                    .param(ParamSpec::unannotated("a"))
                    .param(ParamSpec::unannotated("b"))
                    .build(),
            );
            assert!(msg.contains("every parameter"));
        }

        #[test]
        fn template_and_user_param_conflict() {
            let msg = err_text(
                Descriptor::builder("chat")
                    .user("Hello")
                    .param(ParamSpec::user_message("m"))
                    .build(),
            );
            assert!(msg.contains("both"));
        }

        #[test]
        fn it_requires_single_unannotated() {
            let msg = err_text(
                Descriptor::builder("joke")
                    .user("Tell a joke about {{it}}")
                    .param(ParamSpec::variable("topic"))
                    .build(),
            );
            assert!(msg.contains("{{it}}"));

            Descriptor::builder("joke")
                .user("Tell a joke about {{it}}")
                .param(ParamSpec::unannotated("topic"))
                .build()
                .unwrap();
        }

        #[test]
        fn duplicate_roles_rejected() {
            let msg = err_text(
                Descriptor::builder("chat")
                    .param(ParamSpec::user_message("m"))
                    .param(ParamSpec::memory_id("a"))
                    .param(ParamSpec::memory_id("b"))
                    .build(),
            );
            assert!(msg.contains("MemoryId"));
        }

        #[test]
        fn blank_template_rejected() {
            err_text(Descriptor::builder("chat").user(" ").build());
        }

        #[test]
        fn content_params_can_supply_user_message() {
            Descriptor::builder("describe")
                .param(ParamSpec::content("image"))
                .param(ParamSpec::memory_id("id"))
                .build()
                .unwrap();
        }

        #[test]
        fn variable_bound_twice_rejected() {
            let msg = err_text(
                Descriptor::builder("t")
                    .user("{{x}}")
                    .param(ParamSpec::variable("x"))
                    .param(ParamSpec::variable_as("y", "x"))
                    .build(),
            );
            assert!(msg.contains("bound twice"));
        }
    }

    mod return_shape {
        use super::*;

        #[test]
        fn nested_results_rejected() {
            let shape = ReturnShape::result(ReturnShape::result(ReturnShape::Text));
            assert!(shape.validate().is_err());
            assert!(ReturnShape::result(ReturnShape::Stream).validate().is_err());
        }

        #[test]
        fn unbound_schema_rejected_at_build() {
            let msg = err_text(
                Descriptor::builder("extract")
                    .param(ParamSpec::unannotated("text"))
                    .returns(ReturnShape::Structured(OutputSchema::new("T", json!({}))))
                    .build(),
            );
            assert!(msg.contains("concrete type"));
        }

        #[test]
        fn structured_schema_looks_through_result() {
            let schema = OutputSchema::new("Flag", json!({"type": "boolean"}));
            let shape = ReturnShape::result(ReturnShape::Structured(schema.clone()));
            assert_eq!(shape.structured_schema(), Some(&schema));
            assert_eq!(shape.to_string(), "Result<Structured<Flag>>");
        }

        #[test]
        fn only_results_and_streams_carry_tool_results() {
            assert!(ReturnShape::result(ReturnShape::Text).allows_immediate_return());
            assert!(ReturnShape::Stream.allows_immediate_return());
            assert!(!ReturnShape::Message.allows_immediate_return());
            assert!(!ReturnShape::Unit.allows_immediate_return());
            assert!(!ReturnShape::Text.allows_immediate_return());
        }
    }

    mod table {
        use super::*;

        fn chat(name: &str) -> Descriptor {
            Descriptor::builder(name)
                .param(ParamSpec::unannotated("m"))
                .build()
                .unwrap()
        }

        #[test]
        fn rejects_duplicate_methods() {
            let err = DescriptorTable::new([chat("a"), chat("a")]).unwrap_err();
            assert!(err.to_string().contains("duplicate method"));
        }

        #[test]
        fn looks_up_by_name() {
            let table = DescriptorTable::new([chat("a"), chat("b")]).unwrap();
            assert_eq!(table.len(), 2);
            assert!(table.get("b").is_some());
            assert!(table.get("c").is_none());
        }
    }
}

//! Output mapping: from the terminal model response to the declared return shape.

use std::fmt;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chat::{ChatResponse, ResponseFormat};
use crate::descriptor::ReturnShape;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::retrieval::RetrievedContent;
use crate::tool::{LoopOutcome, ToolExecution};
use crate::usage::Usage;

/// Generate a JSON Schema from a Rust type.
///
/// Returns `(name, schema)` where `name` is the type name and `schema` has
/// the `$schema` meta field removed.
#[must_use]
pub fn generate_json_schema<T: JsonSchema>() -> (String, Value) {
    let root = schemars::schema_for!(T);
    let mut schema = serde_json::to_value(&root).unwrap_or_default();
    if let Value::Object(ref mut map) = schema {
        map.remove("$schema");
    }
    (T::schema_name().into_owned(), schema)
}

/// A named JSON schema describing a structured return type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSchema {
    name: String,
    schema: Value,
}

impl OutputSchema {
    /// Creates an output schema from a name and a schema document.
    #[must_use]
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }

    /// Creates an output schema from a Rust type.
    ///
    /// ```rust,ignore
    /// #[derive(Deserialize, JsonSchema)]
    /// struct Person { name: String, age: u32 }
    ///
    /// let shape = ReturnShape::Structured(OutputSchema::from_type::<Person>());
    /// ```
    #[must_use]
    pub fn from_type<T: JsonSchema>() -> Self {
        let (name, schema) = generate_json_schema::<T>();
        Self::new(name, schema)
    }

    /// Returns the schema name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the JSON Schema definition.
    #[must_use]
    pub const fn schema(&self) -> &Value {
        &self.schema
    }

    /// Native response format for providers with structured-output support.
    #[must_use]
    pub fn to_response_format(&self) -> ResponseFormat {
        ResponseFormat::JsonSchema {
            name: self.name.clone(),
            schema: self.schema.clone(),
        }
    }

    /// Check that the schema describes a concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for an unnamed schema or one that
    /// declares neither a `type`, a `$ref`, nor a combinator.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("output schema must be named"));
        }
        let Some(obj) = self.schema.as_object() else {
            return Err(Error::configuration(format!(
                "output schema '{}' is not a JSON object",
                self.name
            )));
        };
        let concrete = ["type", "$ref", "oneOf", "anyOf", "allOf", "enum", "const"]
            .iter()
            .any(|key| obj.contains_key(*key));
        if concrete {
            Ok(())
        } else {
            Err(Error::configuration(format!(
                "output schema '{}' does not describe a concrete type",
                self.name
            )))
        }
    }
}

/// Turns response text into structured values.
pub trait StructuredOutputParser: Send + Sync + fmt::Debug {
    /// Instructions appended to the user message when the model has no
    /// native structured-output support.
    fn format_instructions(&self, schema: &OutputSchema) -> String;

    /// Parse the response text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutputParsing`] if the text does not hold a value.
    fn parse(&self, text: &str, schema: &OutputSchema) -> Result<Value>;
}

/// JSON parser tolerant of code fences and surrounding prose.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOutputParser;

impl JsonOutputParser {
    fn extract(text: &str) -> &str {
        let trimmed = text.trim();
        let start = trimmed.find(['{', '[']);
        let end = trimmed.rfind(['}', ']']);
        match (start, end) {
            (Some(s), Some(e)) if s <= e => &trimmed[s..=e],
            _ => trimmed,
        }
    }
}

impl StructuredOutputParser for JsonOutputParser {
    fn format_instructions(&self, schema: &OutputSchema) -> String {
        format!(
            "\nYou must answer strictly in the following JSON format: {}",
            schema.schema()
        )
    }

    fn parse(&self, text: &str, schema: &OutputSchema) -> Result<Value> {
        serde_json::from_str(Self::extract(text)).map_err(|e| {
            Error::OutputParsing(format!("expected JSON for '{}': {e}", schema.name()))
        })
    }
}

/// A mapped invocation result.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Output {
    /// Raw response text.
    Text(String),
    /// The full assistant message.
    Message(Message),
    /// A value parsed against an [`OutputSchema`].
    Structured(Value),
    /// Content plus invocation metadata.
    Result(Box<ServiceResult>),
    /// Nothing; the call was made for its side effects.
    Unit,
}

impl Output {
    /// The text, for [`Output::Text`] or a result wrapping it.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Result(result) => result.content.text(),
            _ => None,
        }
    }

    /// Deserialize a structured output into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutputParsing`] if the output is not structured or
    /// does not match `T`.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Structured(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::OutputParsing(e.to_string())),
            Self::Result(result) => result.content.parse(),
            _ => Err(Error::OutputParsing("output is not structured".into())),
        }
    }

    /// The wrapped result, for [`Output::Result`].
    #[must_use]
    pub fn as_result(&self) -> Option<&ServiceResult> {
        match self {
            Self::Result(result) => Some(result),
            _ => None,
        }
    }
}

/// Content of a call together with what it took to produce it.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResult {
    /// The mapped content.
    pub content: Output,
    /// Token usage summed over all model calls of the invocation.
    pub usage: Usage,
    /// Retrieved content used to augment the request.
    pub sources: Vec<RetrievedContent>,
    /// Tool executions in request order.
    pub tool_executions: Vec<ToolExecution>,
    /// Responses that requested tools before the final one.
    pub intermediate_responses: Vec<ChatResponse>,
    /// The terminal response.
    pub final_response: ChatResponse,
    /// Whether the loop stopped on an immediate-return tool.
    pub immediate_tool_return: bool,
}

/// Converts a finished tool loop into the declared return shape.
#[derive(Clone)]
pub struct OutputMapper {
    parser: Arc<dyn StructuredOutputParser>,
}

impl OutputMapper {
    /// Create a mapper with a custom structured-output parser.
    #[must_use]
    pub fn new(parser: Arc<dyn StructuredOutputParser>) -> Self {
        Self { parser }
    }

    /// Format instructions for `shape`, if it is structured.
    #[must_use]
    pub fn format_instructions(&self, shape: &ReturnShape) -> Option<String> {
        shape
            .structured_schema()
            .map(|schema| self.parser.format_instructions(schema))
    }

    /// Map the loop outcome to `shape`.
    ///
    /// With an immediate tool return, the raw result of the last tool
    /// execution stands in for the response text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutputParsing`] if structured parsing fails and
    /// [`Error::Configuration`] for shapes that cannot be produced here.
    pub fn map(
        &self,
        shape: &ReturnShape,
        outcome: LoopOutcome,
        sources: Vec<RetrievedContent>,
    ) -> Result<Output> {
        let text = if outcome.immediate_return {
            outcome
                .aggregate
                .tool_executions
                .last()
                .map(|e| e.result.clone())
        } else {
            outcome.final_response.text()
        };
        match shape {
            ReturnShape::Result(inner) => {
                let content = self.map_content(inner, text, &outcome.final_response)?;
                Ok(Output::Result(Box::new(ServiceResult {
                    content,
                    usage: outcome.aggregate.usage,
                    sources,
                    tool_executions: outcome.aggregate.tool_executions,
                    intermediate_responses: outcome.aggregate.intermediate_responses,
                    final_response: outcome.final_response,
                    immediate_tool_return: outcome.immediate_return,
                })))
            }
            other => self.map_content(other, text, &outcome.final_response),
        }
    }

    fn map_content(
        &self,
        shape: &ReturnShape,
        text: Option<String>,
        response: &ChatResponse,
    ) -> Result<Output> {
        match shape {
            ReturnShape::Text => Ok(Output::Text(text.unwrap_or_default())),
            ReturnShape::Message => Ok(Output::Message(response.message.clone())),
            ReturnShape::Structured(schema) => {
                let text = text.ok_or_else(|| {
                    Error::OutputParsing(format!("no text to parse as '{}'", schema.name()))
                })?;
                Ok(Output::Structured(self.parser.parse(&text, schema)?))
            }
            ReturnShape::Unit => Ok(Output::Unit),
            ReturnShape::Result(_) | ReturnShape::Stream => Err(Error::configuration(format!(
                "return shape {shape} cannot be mapped from a blocking call"
            ))),
        }
    }
}

impl Default for OutputMapper {
    fn default() -> Self {
        Self::new(Arc::new(JsonOutputParser))
    }
}

impl fmt::Debug for OutputMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputMapper")
            .field("parser", &self.parser)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use crate::tool::AggregateResult;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema, PartialEq)]
    struct Person {
        name: String,
        age: u32,
    }

    fn outcome(text: &str) -> LoopOutcome {
        LoopOutcome {
            final_response: ChatResponse::from_text(text).with_usage(Usage::new(5, 5)),
            aggregate: AggregateResult::default(),
            immediate_return: false,
        }
    }

    mod schema {
        use super::*;

        #[test]
        fn from_type_is_valid() {
            let schema = OutputSchema::from_type::<Person>();
            assert_eq!(schema.name(), "Person");
            assert!(schema.schema().get("$schema").is_none());
            schema.validate().unwrap();
        }

        #[test]
        fn open_schema_is_rejected() {
            let schema = OutputSchema::new("Anything", json!({}));
            assert!(matches!(schema.validate(), Err(Error::Configuration(_))));
            assert!(OutputSchema::new("", json!({"type": "object"})).validate().is_err());
        }
    }

    mod parser {
        use super::*;

        #[test]
        fn strips_fences_and_prose() {
            let schema = OutputSchema::from_type::<Person>();
            let value = JsonOutputParser
                .parse("Sure!\n```json\n{\"name\":\"Ada\",\"age\":36}\n```", &schema)
                .unwrap();
            assert_eq!(value["name"], "Ada");
        }

        #[test]
        fn rejects_non_json() {
            let schema = OutputSchema::from_type::<Person>();
            let err = JsonOutputParser.parse("no idea", &schema).unwrap_err();
            assert!(matches!(err, Error::OutputParsing(_)));
        }

        #[test]
        fn instructions_embed_schema() {
            let schema = OutputSchema::new("Flag", json!({"type": "boolean"}));
            let text = JsonOutputParser.format_instructions(&schema);
            assert!(text.contains(r#"{"type":"boolean"}"#));
        }
    }

    mod mapper {
        use super::*;

        #[test]
        fn maps_text() {
            let output = OutputMapper::default()
                .map(&ReturnShape::Text, outcome("hello"), Vec::new())
                .unwrap();
            assert_eq!(output, Output::Text("hello".into()));
        }

        #[test]
        fn maps_structured() {
            let shape = ReturnShape::Structured(OutputSchema::from_type::<Person>());
            let output = OutputMapper::default()
                .map(&shape, outcome(r#"{"name":"Ada","age":36}"#), Vec::new())
                .unwrap();
            let person: Person = output.parse().unwrap();
            assert_eq!(person.age, 36);
        }

        #[test]
        fn result_carries_metadata() {
            let shape = ReturnShape::Result(Box::new(ReturnShape::Text));
            let sources = vec![RetrievedContent::new("doc")];
            let output = OutputMapper::default()
                .map(&shape, outcome("hi"), sources)
                .unwrap();
            let result = output.as_result().unwrap();
            assert_eq!(result.content.text(), Some("hi"));
            assert_eq!(result.usage.total_tokens, 10);
            assert_eq!(result.sources.len(), 1);
            assert!(!result.immediate_tool_return);
        }

        #[test]
        fn immediate_return_surfaces_tool_result() {
            let mut aggregate = AggregateResult::default();
            aggregate.tool_executions.push(ToolExecution::success(
                ToolCall::new("c1", "lookup", "{}"),
                "raw tool text".into(),
            ));
            let outcome = LoopOutcome {
                final_response: ChatResponse::from_tool_calls(vec![ToolCall::new(
                    "c1", "lookup", "{}",
                )]),
                aggregate,
                immediate_return: true,
            };
            let output = OutputMapper::default()
                .map(&ReturnShape::Text, outcome, Vec::new())
                .unwrap();
            assert_eq!(output.text(), Some("raw tool text"));
        }

        #[test]
        fn stream_shape_is_not_mappable() {
            let err = OutputMapper::default()
                .map(&ReturnShape::Stream, outcome("x"), Vec::new())
                .unwrap_err();
            assert!(matches!(err, Error::Configuration(_)));
        }
    }
}

//! Prompt templates and typed variable rendering.
//!
//! Templates use `{{name}}` placeholders. Argument values are rendered to
//! text by a [`VariableRenderer`], which has one rule per kind of value:
//!
//! | value | [`DefaultRenderer`] output |
//! |---|---|
//! | text | as is |
//! | integer, float, bool | `Display` form |
//! | null | `null` |
//! | list | `[a, b, c]`, items rendered recursively |
//! | record | `{k1: v1, k2: v2}`, keys in sorted order |
//! | content blocks (fallback) | text blocks joined by newlines, other blocks dropped |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::Content;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
});

/// A scalar argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// Text.
    Text(String),
}

/// A call argument, as seen by templates and the message assembler.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    /// A single value.
    Scalar(Scalar),
    /// An ordered collection.
    List(Vec<TemplateValue>),
    /// Named fields.
    Record(BTreeMap<String, TemplateValue>),
    /// Multimodal content attached to the user message.
    Content(Vec<Content>),
}

impl TemplateValue {
    /// Check whether the value is [`Scalar::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Scalar::Null))
    }

    /// Convert a JSON value.
    #[must_use]
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::Scalar(Scalar::Null),
            Value::Bool(b) => Self::Scalar(Scalar::Bool(b)),
            Value::Number(n) => n.as_i64().map_or_else(
                || Self::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
                |i| Self::Scalar(Scalar::Integer(i)),
            ),
            Value::String(s) => Self::Scalar(Scalar::Text(s)),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from_json).collect()),
            Value::Object(map) => Self::Record(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for TemplateValue {
    fn from(s: &str) -> Self {
        Self::Scalar(Scalar::Text(s.to_owned()))
    }
}

impl From<String> for TemplateValue {
    fn from(s: String) -> Self {
        Self::Scalar(Scalar::Text(s))
    }
}

impl From<bool> for TemplateValue {
    fn from(b: bool) -> Self {
        Self::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for TemplateValue {
    fn from(i: i64) -> Self {
        Self::Scalar(Scalar::Integer(i))
    }
}

impl From<i32> for TemplateValue {
    fn from(i: i32) -> Self {
        Self::Scalar(Scalar::Integer(i.into()))
    }
}

impl From<u32> for TemplateValue {
    fn from(i: u32) -> Self {
        Self::Scalar(Scalar::Integer(i.into()))
    }
}

impl From<f64> for TemplateValue {
    fn from(f: f64) -> Self {
        Self::Scalar(Scalar::Float(f))
    }
}

impl From<Value> for TemplateValue {
    fn from(value: Value) -> Self {
        Self::from_json(value)
    }
}

impl From<Content> for TemplateValue {
    fn from(content: Content) -> Self {
        Self::Content(vec![content])
    }
}

impl From<Vec<Content>> for TemplateValue {
    fn from(content: Vec<Content>) -> Self {
        Self::Content(content)
    }
}

impl<T: Into<Self>> From<Option<T>> for TemplateValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Scalar(Scalar::Null), Into::into)
    }
}

impl<T: Into<Self>> FromIterator<T> for TemplateValue {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::List(iter.into_iter().map(Into::into).collect())
    }
}

/// Turns argument values into template text.
pub trait VariableRenderer: Send + Sync + fmt::Debug {
    /// Render a scalar.
    fn render_scalar(&self, scalar: &Scalar) -> String;

    /// Render a list.
    fn render_list(&self, items: &[TemplateValue]) -> String;

    /// Render a record.
    fn render_record(&self, fields: &BTreeMap<String, TemplateValue>) -> String;

    /// Render attached content; the fallback for values that are not data.
    fn render_content(&self, content: &[Content]) -> String {
        content
            .iter()
            .filter_map(Content::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Render any value by dispatching on its kind.
    fn render(&self, value: &TemplateValue) -> String {
        match value {
            TemplateValue::Scalar(s) => self.render_scalar(s),
            TemplateValue::List(items) => self.render_list(items),
            TemplateValue::Record(fields) => self.render_record(fields),
            TemplateValue::Content(content) => self.render_content(content),
        }
    }
}

/// The renderer used unless a service overrides it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl VariableRenderer for DefaultRenderer {
    fn render_scalar(&self, scalar: &Scalar) -> String {
        match scalar {
            Scalar::Null => "null".to_owned(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Integer(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Text(s) => s.clone(),
        }
    }

    fn render_list(&self, items: &[TemplateValue]) -> String {
        let rendered: Vec<String> = items.iter().map(|item| self.render(item)).collect();
        format!("[{}]", rendered.join(", "))
    }

    fn render_record(&self, fields: &BTreeMap<String, TemplateValue>) -> String {
        let rendered: Vec<String> = fields
            .iter()
            .map(|(k, v)| format!("{k}: {}", self.render(v)))
            .collect();
        format!("{{{}}}", rendered.join(", "))
    }
}

/// A parsed prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    variables: Vec<String>,
}

impl PromptTemplate {
    /// Parse a template, collecting its placeholder names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the template is blank.
    pub fn parse(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        if source.trim().is_empty() {
            return Err(Error::configuration("prompt template must not be blank"));
        }
        let mut variables: Vec<String> = Vec::new();
        for caps in PLACEHOLDER.captures_iter(&source) {
            let name = caps[1].to_owned();
            if !variables.contains(&name) {
                variables.push(name);
            }
        }
        Ok(Self { source, variables })
    }

    /// The raw template text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of first appearance.
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Check whether the template references `name`.
    #[must_use]
    pub fn references(&self, name: &str) -> bool {
        self.variables.iter().any(|v| v == name)
    }

    /// Check whether the template has any placeholder.
    #[must_use]
    pub fn has_placeholders(&self) -> bool {
        !self.variables.is_empty()
    }

    /// Substitute every placeholder with its rendered value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTemplate`] naming the first placeholder with no value.
    pub fn render<S: std::hash::BuildHasher>(
        &self,
        values: &HashMap<String, String, S>,
    ) -> Result<String> {
        if let Some(missing) = self.variables.iter().find(|v| !values.contains_key(*v)) {
            return Err(Error::template(format!(
                "value for the template variable '{{{{{missing}}}}}' is missing"
            )));
        }
        Ok(PLACEHOLDER
            .replace_all(&self.source, |caps: &regex::Captures<'_>| {
                values.get(&caps[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    mod template {
        use super::*;

        #[test]
        fn renders_all_placeholders() {
            let template = PromptTemplate::parse("Translate to {{language}}: {{text}}").unwrap();
            let out = template
                .render(&values(&[("language", "French"), ("text", "Hello")]))
                .unwrap();
            assert_eq!(out, "Translate to French: Hello");
        }

        #[test]
        fn collects_unique_variables_in_order() {
            let template = PromptTemplate::parse("{{b}} {{ a }} {{b}}").unwrap();
            assert_eq!(template.variables(), ["b", "a"]);
            assert!(template.references("a"));
            assert!(!template.references("c"));
        }

        #[test]
        fn missing_value_is_template_error() {
            let template = PromptTemplate::parse("Hi {{name}}").unwrap();
            let err = template.render(&values(&[])).unwrap_err();
            assert!(matches!(err, Error::MessageTemplate(_)));
            assert!(err.to_string().contains("{{name}}"));
        }

        #[test]
        fn blank_template_is_configuration_error() {
            assert!(matches!(
                PromptTemplate::parse("   "),
                Err(Error::Configuration(_))
            ));
        }

        #[test]
        fn values_are_not_rescanned() {
            let template = PromptTemplate::parse("{{a}}").unwrap();
            let out = template.render(&values(&[("a", "{{b}}")])).unwrap();
            assert_eq!(out, "{{b}}");
        }

        #[test]
        fn text_without_placeholders() {
            let template = PromptTemplate::parse("Tell me a joke").unwrap();
            assert!(!template.has_placeholders());
            assert_eq!(template.render(&values(&[])).unwrap(), "Tell me a joke");
        }
    }

    mod renderer {
        use super::*;

        #[test]
        fn scalars() {
            let r = DefaultRenderer;
            assert_eq!(r.render(&"x".into()), "x");
            assert_eq!(r.render(&42_i64.into()), "42");
            assert_eq!(r.render(&true.into()), "true");
            assert_eq!(r.render(&1.5_f64.into()), "1.5");
            assert_eq!(r.render(&TemplateValue::from(None::<String>)), "null");
        }

        #[test]
        fn lists_use_brackets() {
            let list: TemplateValue = ["a", "b"].into_iter().collect();
            assert_eq!(DefaultRenderer.render(&list), "[a, b]");
        }

        #[test]
        fn records_sort_keys_and_nest() {
            let value = TemplateValue::from(json!({"b": [1, 2], "a": {"x": null}}));
            assert_eq!(DefaultRenderer.render(&value), "{a: {x: null}, b: [1, 2]}");
        }

        #[test]
        fn content_falls_back_to_text_blocks() {
            let value = TemplateValue::Content(vec![
                Content::text("one"),
                Content::image_url("https://x/y.png"),
                Content::text("two"),
            ]);
            assert_eq!(DefaultRenderer.render(&value), "one\ntwo");
        }

        #[test]
        fn custom_list_rule() {
            #[derive(Debug)]
            struct Bullets;

            impl VariableRenderer for Bullets {
                fn render_scalar(&self, scalar: &Scalar) -> String {
                    DefaultRenderer.render_scalar(scalar)
                }
                fn render_list(&self, items: &[TemplateValue]) -> String {
                    items
                        .iter()
                        .map(|i| format!("- {}", self.render(i)))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
                fn render_record(&self, fields: &BTreeMap<String, TemplateValue>) -> String {
                    DefaultRenderer.render_record(fields)
                }
            }

            let list: TemplateValue = ["a", "b"].into_iter().collect();
            assert_eq!(Bullets.render(&list), "- a\n- b");
        }
    }
}

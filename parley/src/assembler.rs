//! Message assembly: descriptor plus arguments in, system and user messages out.
//!
//! Template variables come from three places, later ones winning:
//!
//! 1. the built-ins `current_date`, `current_time` and `current_date_time`,
//!    taken from the invocation timestamp;
//! 2. parameters declared with [`ParamRole::Variable`];
//! 3. a sole unannotated parameter, bound to `{{it}}`.
//!
//! Values are rendered by the service's [`VariableRenderer`]. A null value
//! counts as unbound.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::descriptor::{Descriptor, IT, ParamRole};
use crate::error::{Error, Result};
use crate::message::{Content, Message};
use crate::service::InvocationContext;
use crate::template::{DefaultRenderer, PromptTemplate, TemplateValue, VariableRenderer};

/// Supplies a system message per memory id for methods without a system template.
pub type SystemMessageProvider = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Messages produced for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessages {
    /// The system message, if any.
    pub system: Option<Message>,
    /// The user message.
    pub user: Message,
    /// Rendered template variables.
    pub variables: HashMap<String, String>,
}

/// Builds the messages of a call.
#[derive(Clone)]
pub struct MessageAssembler {
    renderer: Arc<dyn VariableRenderer>,
    system_provider: Option<SystemMessageProvider>,
}

impl MessageAssembler {
    /// Create an assembler.
    #[must_use]
    pub fn new(
        renderer: Arc<dyn VariableRenderer>,
        system_provider: Option<SystemMessageProvider>,
    ) -> Self {
        Self {
            renderer,
            system_provider,
        }
    }

    /// Check whether a system message provider is configured.
    #[must_use]
    pub const fn has_system_provider(&self) -> bool {
        self.system_provider.is_some()
    }

    /// Assemble the messages for `ctx` according to `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTemplate`] when a placeholder has no value or
    /// the user message would be empty.
    pub fn assemble(&self, descriptor: &Descriptor, ctx: &InvocationContext) -> Result<AssembledMessages> {
        let variables = self.variables(descriptor, ctx);
        let system = self.system_message(descriptor, ctx, &variables)?;
        let user = self.user_message(descriptor, ctx, &variables)?;
        Ok(AssembledMessages {
            system,
            user,
            variables,
        })
    }

    /// Append output format instructions to the trailing text of `user`.
    pub fn append_format_instructions(user: &mut Message, instructions: &str) {
        user.append_text(instructions);
    }

    fn render(&self, value: &TemplateValue) -> String {
        self.renderer.render(value)
    }

    fn variables(&self, descriptor: &Descriptor, ctx: &InvocationContext) -> HashMap<String, String> {
        let now = ctx.timestamp();
        let mut variables = HashMap::from([
            ("current_date".to_owned(), now.format("%Y-%m-%d").to_string()),
            ("current_time".to_owned(), now.format("%H:%M:%S").to_string()),
            (
                "current_date_time".to_owned(),
                now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            ),
        ]);
        let args = ctx.args();
        for param in descriptor.params() {
            let Some(value) = args.get(&param.name).filter(|v| !v.is_null()) else {
                continue;
            };
            match &param.role {
                ParamRole::Variable(var) => {
                    variables.insert(var.clone(), self.render(value));
                }
                ParamRole::Unannotated => {
                    variables.insert(IT.to_owned(), self.render(value));
                }
                _ => {}
            }
        }
        variables
    }

    fn system_message(
        &self,
        descriptor: &Descriptor,
        ctx: &InvocationContext,
        variables: &HashMap<String, String>,
    ) -> Result<Option<Message>> {
        if let Some(template) = descriptor.system_template() {
            return Ok(Some(Message::system(template.render(variables)?)));
        }
        let Some(provider) = &self.system_provider else {
            return Ok(None);
        };
        match provider(ctx.memory_id()) {
            Some(text) if !text.trim().is_empty() => {
                let template = PromptTemplate::parse(text)?;
                Ok(Some(Message::system(template.render(variables)?)))
            }
            _ => Ok(None),
        }
    }

    fn user_message(
        &self,
        descriptor: &Descriptor,
        ctx: &InvocationContext,
        variables: &HashMap<String, String>,
    ) -> Result<Message> {
        let args = ctx.args();
        let mut content = Vec::new();

        if let Some(template) = descriptor.user_template() {
            content.push(Content::text(template.render(variables)?));
        } else if let Some(param) = descriptor
            .param_with_role(&ParamRole::UserMessage)
            .or_else(|| descriptor.param_with_role(&ParamRole::Unannotated))
        {
            let value = args.get(&param.name).filter(|v| !v.is_null()).ok_or_else(|| {
                Error::template(format!(
                    "no value for the user message parameter '{}'",
                    param.name
                ))
            })?;
            self.push_value(&mut content, value);
        }

        for param in descriptor.params() {
            if param.role != ParamRole::Content {
                continue;
            }
            if let Some(value) = args.get(&param.name).filter(|v| !v.is_null()) {
                self.push_value(&mut content, value);
            }
        }

        if content.is_empty() {
            return Err(Error::template(format!(
                "method '{}' produced an empty user message",
                descriptor.name()
            )));
        }

        let mut user = Message::user_content(content);
        if let Some(param) = descriptor.param_with_role(&ParamRole::UserName)
            && let Some(value) = args.get(&param.name).filter(|v| !v.is_null())
        {
            user = user.with_name(self.render(value));
        }
        Ok(user)
    }

    /// Content values go in verbatim; anything else is rendered to text.
    fn push_value(&self, content: &mut Vec<Content>, value: &TemplateValue) {
        match value {
            TemplateValue::Content(blocks) => content.extend(blocks.iter().cloned()),
            other => content.push(Content::text(self.render(other))),
        }
    }
}

impl Default for MessageAssembler {
    fn default() -> Self {
        Self::new(Arc::new(DefaultRenderer), None)
    }
}

impl fmt::Debug for MessageAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageAssembler")
            .field("renderer", &self.renderer)
            .field("system_provider", &self.system_provider.is_some())
            .finish()
    }
}

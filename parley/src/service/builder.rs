//! Fluent construction and build-time validation of an [`AiService`].

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::{AiService, DispatchTable, Mode, Route, ServiceInner};
use crate::assembler::{MessageAssembler, SystemMessageProvider};
use crate::chat::{ChatRequest, ChatRequestTransformer, SharedChatProvider};
use crate::config::ServiceConfig;
use crate::descriptor::{Descriptor, DescriptorTable};
use crate::error::{Error, Result, ToolError};
use crate::executor::{SharedTaskExecutor, WorkerPool};
use crate::guardrail::{GuardrailPipeline, InputGuardrail, OutputGuardrail};
use crate::listener::{ListenerSet, SharedInvocationListener};
use crate::memory::SharedChatMemoryStore;
use crate::moderation::SharedModerationModel;
use crate::output::{OutputMapper, StructuredOutputParser};
use crate::retrieval::SharedRetrievalAugmentor;
use crate::template::{DefaultRenderer, VariableRenderer};
use crate::tool::{
    FnTool, HallucinatedToolStrategy, SharedToolExecutor, SharedToolProvider, Tool, ToolErrorHandler,
    ToolPolicy, ToolRegistry, ToolSpecification,
};

/// Builder for [`AiService`].
///
/// Setters never fail; every problem is reported by [`build`](Self::build).
///
/// ```rust,ignore
/// let service = AiService::builder("assistant")
///     .provider(Arc::new(provider))
///     .memory_store(Arc::new(InMemoryChatMemoryStore::new()))
///     .tool(Calculator)
///     .method(Descriptor::builder("chat").param(ParamSpec::unannotated("message")).build()?)
///     .build()?;
/// ```
#[must_use]
pub struct AiServiceBuilder {
    name: String,
    provider: Option<SharedChatProvider>,
    model: Option<String>,
    memory: Option<SharedChatMemoryStore>,
    tools: ToolRegistry,
    tool_provider: Option<SharedToolProvider>,
    immediate_return: Vec<String>,
    policy: ToolPolicy,
    input_guardrails: Vec<InputGuardrail>,
    output_guardrails: Vec<OutputGuardrail>,
    augmentor: Option<SharedRetrievalAugmentor>,
    moderation: Option<SharedModerationModel>,
    system_provider: Option<SystemMessageProvider>,
    listeners: ListenerSet,
    executor: Option<SharedTaskExecutor>,
    renderer: Arc<dyn VariableRenderer>,
    mapper: OutputMapper,
    config: ServiceConfig,
    request_transformer: Option<ChatRequestTransformer>,
    methods: Vec<Descriptor>,
    deferred: Vec<Error>,
}

impl AiServiceBuilder {
    /// Create a builder for a service named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: None,
            model: None,
            memory: None,
            tools: ToolRegistry::new(),
            tool_provider: None,
            immediate_return: Vec::new(),
            policy: ToolPolicy::default(),
            input_guardrails: Vec::new(),
            output_guardrails: Vec::new(),
            augmentor: None,
            moderation: None,
            system_provider: None,
            listeners: ListenerSet::new(),
            executor: None,
            renderer: Arc::new(DefaultRenderer),
            mapper: OutputMapper::default(),
            config: ServiceConfig::default(),
            request_transformer: None,
            methods: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Set the chat model provider. Required.
    pub fn provider(mut self, provider: SharedChatProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Override the provider's default model.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Persist conversations in `store`. Without one, each call starts fresh.
    pub fn memory_store(mut self, store: SharedChatMemoryStore) -> Self {
        self.memory = Some(store);
        self
    }

    /// Register a typed tool.
    pub fn tool<T: Tool + 'static>(mut self, tool: T) -> Self {
        if let Err(e) = self.tools.register(tool) {
            self.deferred.push(e);
        }
        self
    }

    /// Register a closure-backed tool.
    pub fn fn_tool<F>(self, tool: FnTool<F>) -> Self
    where
        F: Fn(Value) -> std::result::Result<String, ToolError> + Send + Sync + 'static,
    {
        let specification = tool.specification().clone();
        self.tool_executor(specification, Arc::new(tool))
    }

    /// Register an executor under an explicit specification.
    pub fn tool_executor(mut self, specification: ToolSpecification, executor: SharedToolExecutor) -> Self {
        if let Err(e) = self.tools.register_executor(specification, executor) {
            self.deferred.push(e);
        }
        self
    }

    /// Resolve extra tools for every invocation.
    pub fn tool_provider(mut self, provider: SharedToolProvider) -> Self {
        self.tool_provider = Some(provider);
        self
    }

    /// End the invocation right after `name` runs, without another model call.
    ///
    /// Only methods returning a `Result` or a stream may offer such a tool.
    pub fn immediate_return(mut self, name: impl Into<String>) -> Self {
        self.immediate_return.push(name.into());
        self
    }

    /// Choose how calls to unknown tools are answered.
    pub fn hallucinated_tool_strategy(mut self, strategy: HallucinatedToolStrategy) -> Self {
        self.policy.hallucinated = strategy;
        self
    }

    /// Handle tool argument errors. Defaults to aborting.
    pub fn on_tool_arguments_error(mut self, handler: impl ToolErrorHandler + 'static) -> Self {
        self.policy.on_arguments_error = Arc::new(handler);
        self
    }

    /// Handle tool execution errors. Defaults to replying with the error text.
    pub fn on_tool_execution_error(mut self, handler: impl ToolErrorHandler + 'static) -> Self {
        self.policy.on_execution_error = Arc::new(handler);
        self
    }

    /// Add a service-level input guardrail, run before method-level ones.
    pub fn input_guardrail(mut self, guardrail: InputGuardrail) -> Self {
        self.input_guardrails.push(guardrail);
        self
    }

    /// Add a service-level output guardrail, run before method-level ones.
    pub fn output_guardrail(mut self, guardrail: OutputGuardrail) -> Self {
        self.output_guardrails.push(guardrail);
        self
    }

    /// Augment user messages with retrieved content.
    pub fn retrieval_augmentor(mut self, augmentor: SharedRetrievalAugmentor) -> Self {
        self.augmentor = Some(augmentor);
        self
    }

    /// Moderate the requests of methods that ask for it.
    pub fn moderation_model(mut self, model: SharedModerationModel) -> Self {
        self.moderation = Some(model);
        self
    }

    /// Supply system messages per memory id for methods without a system template.
    pub fn system_message_provider(
        mut self,
        provider: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.system_provider = Some(Arc::new(provider));
        self
    }

    /// Observe invocations.
    pub fn listener(mut self, listener: SharedInvocationListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Run concurrent tool calls and moderation on `executor` instead of the
    /// default worker pool.
    pub fn executor(mut self, executor: SharedTaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Render template variables with `renderer`.
    pub fn renderer(mut self, renderer: Arc<dyn VariableRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Parse structured responses with `parser`.
    pub fn output_parser(mut self, parser: Arc<dyn StructuredOutputParser>) -> Self {
        self.mapper = OutputMapper::new(parser);
        self
    }

    /// Rewrite every request before it is sent, given the memory id.
    pub fn request_transformer(
        mut self,
        transform: impl Fn(ChatRequest, &str) -> ChatRequest + Send + Sync + 'static,
    ) -> Self {
        self.request_transformer = Some(Arc::new(transform));
        self
    }

    /// Replace all tunables.
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound the number of tool-requesting model turns.
    pub const fn max_tool_turns(mut self, turns: usize) -> Self {
        self.config.max_tool_turns = turns;
        self
    }

    /// Run the tool calls of one turn concurrently.
    pub const fn concurrent_tools(mut self, enabled: bool) -> Self {
        self.config.concurrent_tools = enabled;
        self
    }

    /// Add a method.
    pub fn method(mut self, descriptor: Descriptor) -> Self {
        self.methods.push(descriptor);
        self
    }

    /// Validate everything and build the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for a missing provider, invalid
    /// settings, duplicate or unknown tools, methods that the configured
    /// components cannot serve, and any descriptor that fails validation.
    pub fn build(mut self) -> Result<AiService> {
        if let Some(e) = self.deferred.drain(..).next() {
            return Err(e);
        }
        let provider = self
            .provider
            .take()
            .ok_or_else(|| Error::configuration(format!("service '{}' has no chat provider", self.name)))?;
        self.config.validate()?;
        for name in &self.immediate_return {
            self.tools.set_immediate_return(name)?;
        }
        if self.methods.is_empty() {
            return Err(Error::configuration(format!("service '{}' declares no methods", self.name)));
        }

        let table = DescriptorTable::new(std::mem::take(&mut self.methods))?;
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_owned());
        let mut routes = Vec::with_capacity(table.len());
        for descriptor in table.iter() {
            routes.push(self.route(descriptor, &provider, &model)?);
        }

        self.policy.hallucinated_message.clone_from(&self.config.hallucinated_tool_message);
        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(WorkerPool::new(self.config.worker_pool_size)));
        debug!(
            service = %self.name,
            methods = routes.len(),
            tools = self.tools.len(),
            "Built AI service"
        );

        Ok(AiService {
            inner: Arc::new(ServiceInner {
                name: self.name,
                provider,
                memory: self.memory,
                tools: self.tools,
                tool_provider: self.tool_provider,
                policy: self.policy,
                augmentor: self.augmentor,
                moderation: self.moderation,
                listeners: self.listeners,
                executor,
                assembler: MessageAssembler::new(self.renderer, self.system_provider),
                mapper: self.mapper,
                config: self.config,
                request_transformer: self.request_transformer,
                routes: DispatchTable::new(routes),
            }),
        })
    }

    /// Check one method against the service and resolve its request template.
    fn route(&self, descriptor: &Arc<Descriptor>, provider: &SharedChatProvider, model: &str) -> Result<Route> {
        let fail = |msg: String| {
            Err(Error::configuration(format!(
                "method '{}': {msg}",
                descriptor.name()
            )))
        };

        if descriptor.system_template().is_some() && self.system_provider.is_some() {
            return fail("declares a system template but the service has a system message provider".into());
        }
        if descriptor.moderate() && self.moderation.is_none() {
            return fail("asks for moderation but no moderation model is configured".into());
        }
        if let Some(unknown) = descriptor
            .tools()
            .and_then(|names| names.iter().find(|n| !self.tools.contains(n)))
        {
            return fail(format!("unknown tool '{unknown}'"));
        }

        let shape = descriptor.return_shape();
        let tools = self.tools.scoped(descriptor.tools());
        if !shape.allows_immediate_return()
            && let Some(name) = tools.immediate_return_tools().next()
        {
            return fail(format!(
                "offers immediate-return tool '{name}' but returns {shape}, not a Result"
            ));
        }
        let mode = if shape.is_stream() {
            if !provider.supports_streaming() {
                return fail(format!(
                    "returns a stream but provider '{}' cannot stream",
                    provider.provider_name()
                ));
            }
            Mode::Streaming
        } else {
            Mode::Blocking
        };

        let mut request = ChatRequest::new(model);
        request.temperature = descriptor.temperature();
        request.max_tokens = descriptor.max_tokens();
        let mut format_instructions = None;
        if let Some(schema) = shape.structured_schema() {
            if provider.supports_structured_output() {
                request = request.response_format(schema.to_response_format());
            } else {
                format_instructions = self.mapper.format_instructions(shape);
            }
        }

        let input = self
            .input_guardrails
            .iter()
            .chain(descriptor.input_guardrails())
            .cloned()
            .collect();
        let output = self
            .output_guardrails
            .iter()
            .chain(descriptor.output_guardrails())
            .cloned()
            .collect();

        Ok(Route {
            descriptor: Arc::clone(descriptor),
            mode,
            guardrails: GuardrailPipeline::new(input, output, self.config.max_output_guardrail_retries),
            tools,
            request,
            format_instructions,
        })
    }
}

impl fmt::Debug for AiServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiServiceBuilder")
            .field("name", &self.name)
            .field("has_provider", &self.provider.is_some())
            .field("tools", &self.tools)
            .field("methods", &self.methods.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

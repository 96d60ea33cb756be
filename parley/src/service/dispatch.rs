//! Dispatch table and the blocking invocation flow.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Args, InvocationContext, ServiceInner};
use crate::assembler::{AssembledMessages, MessageAssembler};
use crate::chat::{ChatRequest, ChatResponse};
use crate::descriptor::{Descriptor, ParamRole};
use crate::error::{Error, LlmError, Result};
use crate::executor::{TaskHandle, submit};
use crate::guardrail::{GuardrailContext, GuardrailPipeline, OutputOutcome};
use crate::memory::Conversation;
use crate::message::Message;
use crate::moderation::{Moderation, moderation_input};
use crate::output::Output;
use crate::retrieval::{AugmentationRequest, AugmentationResult};
use crate::template::{DefaultRenderer, Scalar, TemplateValue, VariableRenderer};
use crate::tool::{AggregateResult, LoopOutcome, ToolLoop, ToolProviderRequest, ToolRegistry};

/// How a method delivers its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Through [`AiService::invoke`](crate::AiService::invoke).
    Blocking,
    /// Through [`AiService::invoke_streaming`](crate::AiService::invoke_streaming).
    Streaming,
}

/// Everything resolved for one method at build time.
#[derive(Debug)]
pub(crate) struct Route {
    pub(crate) descriptor: Arc<Descriptor>,
    pub(crate) mode: Mode,
    pub(crate) guardrails: GuardrailPipeline,
    /// The only tools this method may run.
    pub(crate) tools: ToolRegistry,
    /// Model and sampling overrides; tools and messages are added per call.
    pub(crate) request: ChatRequest,
    /// Present when the provider lacks native structured output.
    pub(crate) format_instructions: Option<String>,
}

/// Immutable map from method name to route.
#[derive(Debug, Default)]
pub(crate) struct DispatchTable {
    routes: HashMap<String, Arc<Route>>,
}

impl DispatchTable {
    pub(crate) fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|r| (r.descriptor.name().to_owned(), Arc::new(r)))
                .collect(),
        }
    }

    pub(crate) fn get(&self, method: &str) -> Option<&Arc<Route>> {
        self.routes.get(method)
    }

    pub(crate) fn methods(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.routes.len()
    }

    /// Look up `method` and check it is called the way it is declared.
    pub(crate) fn route(&self, method: &str, mode: Mode) -> Result<Arc<Route>> {
        let route = self
            .get(method)
            .ok_or_else(|| Error::configuration(format!("unknown method '{method}'")))?;
        if route.mode != mode {
            let hint = match route.mode {
                Mode::Blocking => "invoke",
                Mode::Streaming => "invoke_streaming",
            };
            return Err(Error::configuration(format!(
                "method '{method}' must be called through {hint}"
            )));
        }
        Ok(Arc::clone(route))
    }
}

/// State after the pre-model phase: memory written, moderation started.
pub(crate) struct Prepared {
    pub(crate) conversation: Conversation,
    pub(crate) augmentation: Option<AugmentationResult>,
    pub(crate) variables: HashMap<String, String>,
    pub(crate) moderation: Option<TaskHandle<Result<Moderation>>>,
    /// The route's tools plus provided ones, when a tool provider is set.
    pub(crate) tools: Option<ToolRegistry>,
}

impl ServiceInner {
    /// Validate the arguments and create the invocation context.
    pub(crate) fn invocation(
        &self,
        route: &Route,
        method: &str,
        args: Args,
    ) -> Result<InvocationContext> {
        let descriptor = &route.descriptor;
        if let Some(unknown) = args
            .names()
            .find(|name| !descriptor.params().iter().any(|p| p.name == *name))
        {
            return Err(Error::configuration(format!(
                "method '{method}' has no parameter '{unknown}'"
            )));
        }
        let memory_id = self.resolve_memory_id(descriptor, &args)?;
        Ok(InvocationContext::new(&self.name, method, args, memory_id))
    }

    fn resolve_memory_id(&self, descriptor: &Descriptor, args: &Args) -> Result<String> {
        let Some(param) = descriptor.param_with_role(&ParamRole::MemoryId) else {
            return Ok(self.config.default_memory_id.clone());
        };
        match args.get(&param.name) {
            Some(TemplateValue::Scalar(Scalar::Text(id))) if !id.trim().is_empty() => Ok(id.clone()),
            Some(TemplateValue::Scalar(scalar @ (Scalar::Integer(_) | Scalar::Bool(_)))) => {
                Ok(DefaultRenderer.render_scalar(scalar))
            }
            Some(TemplateValue::Scalar(Scalar::Null | Scalar::Text(_))) | None => Err(Error::configuration(format!(
                "memory id parameter '{}' must be provided and not blank",
                param.name
            ))),
            Some(_) => Err(Error::configuration(format!(
                "memory id parameter '{}' must be a string or an integer",
                param.name
            ))),
        }
    }

    /// The loop for one invocation over `tools`, the route's or a provided superset.
    pub(crate) fn tool_loop<'a>(
        &'a self,
        route: &Route,
        tools: &'a ToolRegistry,
        invocation: &'a InvocationContext,
    ) -> ToolLoop<'a> {
        ToolLoop {
            provider: self.provider.as_ref(),
            tools,
            policy: &self.policy,
            executor: &self.executor,
            listeners: &self.listeners,
            invocation,
            request: ChatRequest {
                tools: tools.specifications(None),
                ..route.request.clone()
            },
            transformer: self.request_transformer.as_ref(),
            max_turns: self.config.max_tool_turns,
            concurrent: self.config.concurrent_tools,
            allow_immediate_return: route.descriptor.return_shape().allows_immediate_return(),
        }
    }

    /// Merge the provider's tools for this invocation into a copy of the route's.
    async fn provided_tools(
        &self,
        route: &Route,
        invocation: &InvocationContext,
        user: &Message,
    ) -> Result<Option<ToolRegistry>> {
        let Some(provider) = &self.tool_provider else {
            return Ok(None);
        };
        let provided = provider
            .provide_tools(ToolProviderRequest {
                invocation,
                user_message: user,
            })
            .await?;
        debug!(tools = provided.tools.len(), "Provided tools");
        let mut tools = route.tools.clone();
        tools.extend_with(provided)?;
        Ok(Some(tools))
    }

    /// Augment, guard and store the user message; start moderation.
    pub(crate) async fn prepare(
        &self,
        route: &Route,
        invocation: &InvocationContext,
        assembled: AssembledMessages,
    ) -> Result<Prepared> {
        let AssembledMessages {
            system,
            user,
            variables,
        } = assembled;
        let mut conversation = Conversation::new(self.memory.clone(), invocation.memory_id());

        let augmentation = match &self.augmentor {
            Some(augmentor) => Some(
                augmentor
                    .augment(AugmentationRequest {
                        message: &user,
                        invocation,
                    })
                    .await?,
            ),
            None => None,
        };
        let user = augmentation.as_ref().map_or(user, |a| a.message.clone());

        let history = conversation.messages().await?;
        let mut user = route
            .guardrails
            .check_input(
                user,
                &GuardrailContext {
                    invocation,
                    memory: &history,
                    augmentation: augmentation.as_ref(),
                    variables: &variables,
                },
            )
            .await?;
        if let Some(instructions) = &route.format_instructions {
            MessageAssembler::append_format_instructions(&mut user, instructions);
        }
        let tools = self.provided_tools(route, invocation, &user).await?;

        if let Some(system) = system {
            conversation.append(system).await?;
        }
        conversation.append(user).await?;
        debug!(memory_id = conversation.memory_id(), "Stored request messages");

        let moderation = if route.descriptor.moderate() {
            let model = self
                .moderation
                .clone()
                .ok_or_else(|| Error::configuration("no moderation model is configured"))?;
            let messages = moderation_input(&conversation.messages().await?);
            debug!(messages = messages.len(), "Starting moderation");
            Some(submit(self.executor.as_ref(), async move {
                model.moderate(&messages).await
            }))
        } else {
            None
        };

        Ok(Prepared {
            conversation,
            augmentation,
            variables,
            moderation,
            tools,
        })
    }

    /// Wait for a started moderation and turn a flag into an error.
    pub(crate) async fn join_moderation(
        &self,
        handle: Option<TaskHandle<Result<Moderation>>>,
    ) -> Result<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        let moderation = handle.join().await.ok_or_else(|| {
            LlmError::provider("moderation", "moderation task ended without a verdict")
        })??;
        if moderation.flagged {
            return Err(Error::ModerationFlagged {
                flagged_text: moderation.flagged_text.unwrap_or_default(),
            });
        }
        Ok(())
    }

    pub(crate) async fn invoke_blocking(
        &self,
        route: &Route,
        invocation: &InvocationContext,
    ) -> Result<Output> {
        self.listeners.start(invocation).await;
        match self.run_blocking(route, invocation).await {
            Ok((output, response)) => {
                self.listeners.complete(invocation, &response).await;
                Ok(output)
            }
            Err(err) => {
                self.listeners.error(invocation, &err).await;
                Err(err)
            }
        }
    }

    async fn run_blocking(
        &self,
        route: &Route,
        invocation: &InvocationContext,
    ) -> Result<(Output, ChatResponse)> {
        let assembled = self.assembler.assemble(&route.descriptor, invocation)?;
        let mut prepared = self.prepare(route, invocation, assembled).await?;
        let outcome = self.run_guarded(route, invocation, &mut prepared).await?;

        self.join_moderation(prepared.moderation.take()).await?;
        if !outcome.immediate_return {
            prepared
                .conversation
                .append(outcome.final_response.message.clone())
                .await?;
        }

        let response = outcome
            .final_response
            .clone()
            .with_usage(outcome.aggregate.usage);
        let sources = prepared
            .augmentation
            .map(|a| a.sources)
            .unwrap_or_default();
        let output = self
            .mapper
            .map(route.descriptor.return_shape(), outcome, sources)?;
        Ok((output, response))
    }

    /// Run the tool loop until the output guardrails accept its answer.
    async fn run_guarded(
        &self,
        route: &Route,
        invocation: &InvocationContext,
        prepared: &mut Prepared,
    ) -> Result<LoopOutcome> {
        let tools = prepared.tools.take();
        let tool_loop = self.tool_loop(route, tools.as_ref().unwrap_or(&route.tools), invocation);
        let mut budget = route.guardrails.budget();
        let mut aggregate = AggregateResult::default();
        loop {
            let mut outcome = tool_loop.run(&mut prepared.conversation, aggregate).await?;
            if outcome.immediate_return || !route.guardrails.has_output_guardrails() {
                return Ok(outcome);
            }

            let attempt = budget.attempt();
            let memory = prepared.conversation.messages().await?;
            let ctx = GuardrailContext {
                invocation,
                memory: &memory,
                augmentation: prepared.augmentation.as_ref(),
                variables: &prepared.variables,
            };
            let verdict = route
                .guardrails
                .check_output(outcome.final_response.clone(), &ctx, attempt)
                .await?;
            budget.spend(&verdict, &outcome.final_response)?;
            match verdict {
                OutputOutcome::Pass(response) => {
                    outcome.final_response = response;
                    return Ok(outcome);
                }
                OutputOutcome::Retry { .. } => {}
                OutputOutcome::Reprompt { message, .. } => {
                    prepared
                        .conversation
                        .append(outcome.final_response.message.clone())
                        .await?;
                    prepared.conversation.append(message).await?;
                }
            }
            aggregate = outcome.aggregate;
        }
    }
}

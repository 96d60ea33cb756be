//! The tool execution loop.
//!
//! ```text
//! AWAITING_MODEL --no tool calls--> COMPLETE
//!       |                              ^
//!       +--tool calls--> EXECUTING_TOOLS --immediate return--+
//!       ^                      |
//!       +----------------------+
//! ```
//!
//! Every response that requests tools counts as one tool turn. Exceeding
//! the configured number of tool turns fails with
//! [`Error::ToolLoopExceeded`].
//!
//! Tool results are appended to memory in request order, whatever order the
//! executions finish in. The assistant message requesting the tools is
//! stored together with its results, so an aborted turn leaves memory as it
//! was before the turn.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, Span, debug, info_span, warn};

use super::{SharedToolExecutor, ToolErrorContext, ToolErrorOutcome, ToolExecution, ToolPolicy, ToolRegistry};
use crate::chat::{ChatProvider, ChatRequest, ChatRequestTransformer, ChatResponse};
use crate::error::{Error, Result, ToolError};
use crate::executor::{SharedTaskExecutor, submit};
use crate::listener::ListenerSet;
use crate::memory::Conversation;
use crate::message::{Message, ToolCall};
use crate::service::InvocationContext;
use crate::usage::Usage;

/// What a loop accumulated across model turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Token usage over every model call.
    pub usage: Usage,
    /// Executed tool calls, in request order.
    pub tool_executions: Vec<ToolExecution>,
    /// Responses that requested tools.
    pub intermediate_responses: Vec<ChatResponse>,
    /// Number of model turns that requested tools.
    pub tool_turns: usize,
}

impl AggregateResult {
    /// Add a model response's usage.
    pub fn add_usage(&mut self, response: &ChatResponse) {
        self.usage += response.usage;
    }
}

/// How a loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// The last model response.
    pub final_response: ChatResponse,
    /// What was accumulated.
    pub aggregate: AggregateResult,
    /// Whether the loop stopped on immediate-return tools instead of a
    /// response without tool calls.
    pub immediate_return: bool,
}

/// The next state after a model response.
enum NextStep {
    Complete,
    ExecuteTools(Vec<ToolCall>),
}

impl NextStep {
    fn classify(response: &ChatResponse) -> Self {
        if response.has_tool_calls() {
            Self::ExecuteTools(response.tool_calls().to_vec())
        } else {
            Self::Complete
        }
    }
}

/// A call resolved against the registry.
enum Planned {
    Run(SharedToolExecutor),
    Hallucinated(String),
}

/// Drives one invocation through model calls and tool executions.
pub(crate) struct ToolLoop<'a> {
    pub(crate) provider: &'a dyn ChatProvider,
    pub(crate) tools: &'a ToolRegistry,
    pub(crate) policy: &'a ToolPolicy,
    pub(crate) executor: &'a SharedTaskExecutor,
    pub(crate) listeners: &'a ListenerSet,
    pub(crate) invocation: &'a InvocationContext,
    /// Model, tools and sampling settings; messages are filled per call.
    pub(crate) request: ChatRequest,
    pub(crate) transformer: Option<&'a ChatRequestTransformer>,
    pub(crate) max_turns: usize,
    pub(crate) concurrent: bool,
    /// Whether the return shape can carry a raw tool result.
    pub(crate) allow_immediate_return: bool,
}

impl ToolLoop<'_> {
    /// The request for the current conversation.
    pub(crate) fn request_for(&self, messages: Vec<Message>) -> ChatRequest {
        let request = ChatRequest {
            messages,
            ..self.request.clone()
        };
        match self.transformer {
            Some(transform) => transform(request, self.invocation.memory_id()),
            None => request,
        }
    }

    /// Run until the model stops requesting tools.
    pub(crate) async fn run(
        &self,
        conversation: &mut Conversation,
        aggregate: AggregateResult,
    ) -> Result<LoopOutcome> {
        let mut aggregate = aggregate;
        loop {
            let request = self.request_for(conversation.messages().await?);
            debug!(messages = request.messages.len(), "Awaiting model");
            let response = self.provider.chat(&request).await?;
            aggregate.add_usage(&response);
            self.listeners.response(self.invocation, &response).await;

            match NextStep::classify(&response) {
                NextStep::Complete => {
                    debug!(tool_turns = aggregate.tool_turns, "Loop complete");
                    return Ok(LoopOutcome {
                        final_response: response,
                        aggregate,
                        immediate_return: false,
                    });
                }
                NextStep::ExecuteTools(calls) => {
                    self.begin_tool_turn(&mut aggregate)?;
                    let immediate = self.returns_immediately(&calls)?;
                    let executions = self.execute(&calls).await?;
                    conversation.append(response.message.clone()).await?;
                    self.record(conversation, &mut aggregate, executions).await?;

                    if immediate {
                        debug!("Immediate return after tool execution");
                        return Ok(LoopOutcome {
                            final_response: response,
                            aggregate,
                            immediate_return: true,
                        });
                    }
                    aggregate.intermediate_responses.push(response);
                }
            }
        }
    }

    /// Count a tool-requesting turn.
    pub(crate) fn begin_tool_turn(&self, aggregate: &mut AggregateResult) -> Result<()> {
        aggregate.tool_turns += 1;
        if aggregate.tool_turns > self.max_turns {
            warn!(max_turns = self.max_turns, "Tool loop bound exceeded");
            return Err(Error::ToolLoopExceeded {
                max_turns: self.max_turns,
            });
        }
        debug!(turn = aggregate.tool_turns, "Executing tools");
        Ok(())
    }

    /// Check whether every call of the turn targets an immediate-return tool.
    ///
    /// Fails before anything runs when the method's return shape cannot
    /// carry the tool result.
    pub(crate) fn returns_immediately(&self, calls: &[ToolCall]) -> Result<bool> {
        let immediate =
            !calls.is_empty() && calls.iter().all(|c| self.tools.is_immediate_return(&c.name));
        if immediate && !self.allow_immediate_return {
            return Err(Error::configuration(format!(
                "tool '{}' returns immediately but method '{}' does not return a Result",
                calls[0].name,
                self.invocation.method()
            )));
        }
        Ok(immediate)
    }

    /// Append tool results to memory and the aggregate, in request order.
    pub(crate) async fn record(
        &self,
        conversation: &mut Conversation,
        aggregate: &mut AggregateResult,
        executions: Vec<ToolExecution>,
    ) -> Result<()> {
        for execution in executions {
            conversation
                .append(Message::tool_result(&execution.request, execution.result.clone()))
                .await?;
            self.listeners.tool_executed(self.invocation, &execution).await;
            aggregate.tool_executions.push(execution);
        }
        Ok(())
    }

    /// Execute the calls of one turn and apply the error policy.
    pub(crate) async fn execute(&self, calls: &[ToolCall]) -> Result<Vec<ToolExecution>> {
        let planned = self.plan(calls)?;
        let spans: Vec<Span> = calls
            .iter()
            .map(|call| {
                info_span!(
                    "tool",
                    tool.name = %call.name,
                    tool.id = %call.id,
                    tool.result_len = tracing::field::Empty,
                    tool.error = tracing::field::Empty,
                )
            })
            .collect();

        let runnable = planned.iter().filter(|p| matches!(p, Planned::Run(_))).count();
        let raw = if self.concurrent && runnable > 1 {
            self.run_concurrent(calls, &planned, &spans).await
        } else {
            self.run_sequential(calls, &planned, &spans).await
        };

        let mut executions = Vec::with_capacity(calls.len());
        for (((call, plan), outcome), span) in calls.iter().zip(&planned).zip(raw).zip(&spans) {
            let execution = match (plan, outcome) {
                (Planned::Hallucinated(reply), _) => {
                    ToolExecution::failure(call.clone(), reply.clone())
                }
                (Planned::Run(_), Ok(result)) => {
                    span.record("tool.result_len", result.len());
                    ToolExecution::success(call.clone(), result)
                }
                (Planned::Run(_), Err(err)) => {
                    span.record("tool.error", err.message());
                    self.handle_error(call, err)?
                }
            };
            executions.push(execution);
        }
        Ok(executions)
    }

    fn plan(&self, calls: &[ToolCall]) -> Result<Vec<Planned>> {
        calls
            .iter()
            .map(|call| match self.tools.executor(&call.name) {
                Some(executor) => Ok(Planned::Run(Arc::clone(executor))),
                None => {
                    warn!(tool = %call.name, "Model requested an unknown tool");
                    self.policy
                        .hallucination_reply(call)
                        .map(Planned::Hallucinated)
                        .ok_or_else(|| Error::ToolExecution {
                            tool: call.name.clone(),
                            message: format!("there is no tool called '{}'", call.name),
                        })
                }
            })
            .collect()
    }

    async fn run_sequential(
        &self,
        calls: &[ToolCall],
        planned: &[Planned],
        spans: &[Span],
    ) -> Vec<Result<String, ToolError>> {
        let memory_id = self.invocation.memory_id();
        let mut results = Vec::with_capacity(calls.len());
        for ((call, plan), span) in calls.iter().zip(planned).zip(spans) {
            let result = match plan {
                Planned::Run(executor) => {
                    executor
                        .execute(call, memory_id)
                        .instrument(span.clone())
                        .await
                }
                Planned::Hallucinated(_) => Ok(String::new()),
            };
            results.push(result);
        }
        results
    }

    async fn run_concurrent(
        &self,
        calls: &[ToolCall],
        planned: &[Planned],
        spans: &[Span],
    ) -> Vec<Result<String, ToolError>> {
        let handles: Vec<_> = calls
            .iter()
            .zip(planned)
            .zip(spans)
            .map(|((call, plan), span)| match plan {
                Planned::Run(executor) => {
                    let executor = Arc::clone(executor);
                    let call = call.clone();
                    let memory_id = self.invocation.memory_id().to_owned();
                    Some(submit(
                        self.executor.as_ref(),
                        async move { executor.execute(&call, &memory_id).await }
                            .instrument(span.clone()),
                    ))
                }
                Planned::Hallucinated(_) => None,
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = match handle {
                Some(handle) => handle
                    .join()
                    .await
                    .unwrap_or_else(|| Err(ToolError::execution("tool task was dropped"))),
                None => Ok(String::new()),
            };
            results.push(result);
        }
        results
    }

    fn handle_error(&self, call: &ToolCall, err: ToolError) -> Result<ToolExecution> {
        let ctx = ToolErrorContext {
            call,
            invocation: self.invocation,
        };
        match self.policy.handler_for(&err).handle(&err, ctx) {
            ToolErrorOutcome::Reply(text) => {
                warn!(tool = %call.name, error = %err, "Tool failed; reporting to model");
                Ok(ToolExecution::failure(call.clone(), text))
            }
            ToolErrorOutcome::Abort => Err(match err {
                ToolError::Arguments(message) => Error::ToolArguments {
                    tool: call.name.clone(),
                    message,
                },
                ToolError::Execution(message) => Error::ToolExecution {
                    tool: call.name.clone(),
                    message,
                },
            }),
        }
    }
}

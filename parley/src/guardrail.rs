//! Guardrails: validation gates around the model call.
//!
//! - **[`InputGuardrail`]** checks the user message once, after retrieval
//!   augmentation and before the first model call. It can pass, rewrite or
//!   reject. A rejection is final.
//! - **[`OutputGuardrail`]** checks every terminal response before it
//!   reaches the caller. Besides pass, rewrite and reject it can ask for a
//!   **retry** (same request again) or a **reprompt** (append a corrective
//!   user message, then call again).
//!
//! Guardrails run in order, service-level ones first. When any output
//! guardrail asks for a retry or reprompt, the whole chain runs again on the
//! new response. Retries are bounded; once the budget is spent the last
//! failure surfaces as [`Error::OutputGuardrailRejected`].
//!
//! # Example
//!
//! ```rust,ignore
//! struct NoApologies;
//!
//! #[async_trait]
//! impl OutputGuardrailCheck for NoApologies {
//!     async fn check(&self, response: &ChatResponse, _ctx: &GuardrailContext<'_>) -> Result<OutputVerdict> {
//!         match response.text() {
//!             Some(text) if text.starts_with("Sorry") => {
//!                 Ok(OutputVerdict::reprompt("apology", "Answer without apologising."))
//!             }
//!             _ => Ok(OutputVerdict::Pass),
//!         }
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::chat::ChatResponse;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::retrieval::AugmentationResult;
use crate::service::InvocationContext;

/// Read-only view handed to guardrail checks.
#[derive(Debug, Clone, Copy)]
pub struct GuardrailContext<'a> {
    /// The running invocation.
    pub invocation: &'a InvocationContext,
    /// Conversation history as the model sees it.
    pub memory: &'a [Message],
    /// The retrieval augmentation, when one ran.
    pub augmentation: Option<&'a AugmentationResult>,
    /// Rendered template variables.
    pub variables: &'a HashMap<String, String>,
}

/// Decision of an input guardrail.
#[derive(Debug, Clone, PartialEq)]
pub enum InputVerdict {
    /// Keep the message.
    Pass,
    /// Replace the message.
    Rewrite(Message),
    /// Stop the invocation.
    Reject(String),
}

/// Decision of an output guardrail.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputVerdict {
    /// Keep the response.
    Pass,
    /// Replace the response.
    Rewrite(ChatResponse),
    /// Stop the invocation.
    Reject(String),
    /// Re-issue the same request.
    Retry(String),
    /// Append `prompt` as a user message and call the model again.
    Reprompt {
        /// Why the response failed.
        reason: String,
        /// Corrective instruction for the model.
        prompt: String,
    },
}

impl OutputVerdict {
    /// Shorthand for [`OutputVerdict::Reprompt`].
    #[must_use]
    pub fn reprompt(reason: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::Reprompt {
            reason: reason.into(),
            prompt: prompt.into(),
        }
    }
}

/// Check logic of an input guardrail.
#[async_trait]
pub trait InputGuardrailCheck: Send + Sync {
    /// Evaluate the user message.
    async fn check(&self, message: &Message, ctx: &GuardrailContext<'_>) -> Result<InputVerdict>;
}

/// Check logic of an output guardrail.
#[async_trait]
pub trait OutputGuardrailCheck: Send + Sync {
    /// Evaluate a terminal response.
    async fn check(
        &self,
        response: &ChatResponse,
        ctx: &GuardrailContext<'_>,
    ) -> Result<OutputVerdict>;
}

/// A named input guardrail.
#[derive(Clone)]
pub struct InputGuardrail {
    name: String,
    check: Arc<dyn InputGuardrailCheck>,
}

impl InputGuardrail {
    /// Wrap check logic under a name used in logs and errors.
    #[must_use]
    pub fn new(name: impl Into<String>, check: impl InputGuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Guardrail name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for InputGuardrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputGuardrail")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named output guardrail.
#[derive(Clone)]
pub struct OutputGuardrail {
    name: String,
    check: Arc<dyn OutputGuardrailCheck>,
}

impl OutputGuardrail {
    /// Wrap check logic under a name used in logs and errors.
    #[must_use]
    pub fn new(name: impl Into<String>, check: impl OutputGuardrailCheck + 'static) -> Self {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Guardrail name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for OutputGuardrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputGuardrail")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// What the output chain decided about one response.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputOutcome {
    /// Every guardrail passed; this is the (possibly rewritten) response.
    Pass(ChatResponse),
    /// A guardrail asked for the same request again.
    Retry {
        /// The guardrail that asked.
        guardrail: String,
        /// Why.
        reason: String,
    },
    /// A guardrail asked for a corrective message and another call.
    Reprompt {
        /// The guardrail that asked.
        guardrail: String,
        /// Why.
        reason: String,
        /// The corrective user message.
        message: Message,
    },
}

/// The ordered guardrails of one method.
#[derive(Debug, Clone, Default)]
pub struct GuardrailPipeline {
    input: Vec<InputGuardrail>,
    output: Vec<OutputGuardrail>,
    max_retries: usize,
}

impl GuardrailPipeline {
    /// Create a pipeline allowing `max_retries` output retries or reprompts.
    #[must_use]
    pub const fn new(
        input: Vec<InputGuardrail>,
        output: Vec<OutputGuardrail>,
        max_retries: usize,
    ) -> Self {
        Self {
            input,
            output,
            max_retries,
        }
    }

    /// Check whether there are no output guardrails.
    #[must_use]
    pub fn has_output_guardrails(&self) -> bool {
        !self.output.is_empty()
    }

    /// Input guardrails, in evaluation order.
    #[must_use]
    pub fn input_guardrails(&self) -> &[InputGuardrail] {
        &self.input
    }

    /// Output guardrails, in evaluation order.
    #[must_use]
    pub fn output_guardrails(&self) -> &[OutputGuardrail] {
        &self.output
    }

    /// Run the input chain. Each guardrail sees the previous one's rewrite.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InputGuardrailRejected`] on the first rejection, or
    /// whatever a check fails with.
    pub async fn check_input(&self, message: Message, ctx: &GuardrailContext<'_>) -> Result<Message> {
        let mut message = message;
        for guardrail in &self.input {
            match guardrail.check.check(&message, ctx).await? {
                InputVerdict::Pass => {}
                InputVerdict::Rewrite(rewritten) => {
                    debug!(guardrail = %guardrail.name, "Input rewritten");
                    message = rewritten;
                }
                InputVerdict::Reject(reason) => {
                    return Err(Error::InputGuardrailRejected {
                        guardrail: guardrail.name.clone(),
                        reason,
                    });
                }
            }
        }
        Ok(message)
    }

    /// Run the output chain once over `response`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutputGuardrailRejected`] on a rejection, or whatever
    /// a check fails with.
    pub async fn check_output(
        &self,
        response: ChatResponse,
        ctx: &GuardrailContext<'_>,
        attempt: usize,
    ) -> Result<OutputOutcome> {
        let mut response = response;
        for guardrail in &self.output {
            match guardrail.check.check(&response, ctx).await? {
                OutputVerdict::Pass => {}
                OutputVerdict::Rewrite(rewritten) => {
                    debug!(guardrail = %guardrail.name, "Output rewritten");
                    response = rewritten;
                }
                OutputVerdict::Reject(reason) => {
                    return Err(Error::OutputGuardrailRejected {
                        guardrail: guardrail.name.clone(),
                        reason,
                        attempts: attempt,
                        last_response: Box::new(response),
                    });
                }
                OutputVerdict::Retry(reason) => {
                    return Ok(OutputOutcome::Retry {
                        guardrail: guardrail.name.clone(),
                        reason,
                    });
                }
                OutputVerdict::Reprompt { reason, prompt } => {
                    return Ok(OutputOutcome::Reprompt {
                        guardrail: guardrail.name.clone(),
                        reason,
                        message: Message::user(prompt),
                    });
                }
            }
        }
        Ok(OutputOutcome::Pass(response))
    }

    /// Start counting output attempts for one invocation.
    #[must_use]
    pub const fn budget(&self) -> RetryBudget {
        RetryBudget {
            max_retries: self.max_retries,
            attempts: 0,
        }
    }
}

/// Counts output guardrail evaluations of one invocation.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    max_retries: usize,
    attempts: usize,
}

impl RetryBudget {
    /// Register an evaluation and return its 1-based number.
    pub const fn attempt(&mut self) -> usize {
        self.attempts += 1;
        self.attempts
    }

    /// Spend one retry for `outcome`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutputGuardrailRejected`] carrying `last_response`
    /// once the retries are exhausted.
    pub fn spend(&self, outcome: &OutputOutcome, last_response: &ChatResponse) -> Result<()> {
        let (guardrail, reason, kind) = match outcome {
            OutputOutcome::Pass(_) => return Ok(()),
            OutputOutcome::Retry { guardrail, reason } => (guardrail, reason, "retry"),
            OutputOutcome::Reprompt {
                guardrail, reason, ..
            } => (guardrail, reason, "reprompt"),
        };
        if self.attempts > self.max_retries {
            return Err(Error::OutputGuardrailRejected {
                guardrail: guardrail.clone(),
                reason: format!("{reason} (gave up after {} attempts)", self.attempts),
                attempts: self.attempts,
                last_response: Box::new(last_response.clone()),
            });
        }
        warn!(guardrail = %guardrail, reason = %reason, attempt = self.attempts, kind, "Output guardrail failed");
        Ok(())
    }

    /// Evaluations so far.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Blocklist(&'static str);

    #[async_trait]
    impl InputGuardrailCheck for Blocklist {
        async fn check(&self, message: &Message, _ctx: &GuardrailContext<'_>) -> Result<InputVerdict> {
            if message.text().unwrap_or_default().contains(self.0) {
                Ok(InputVerdict::Reject(format!("contains '{}'", self.0)))
            } else {
                Ok(InputVerdict::Pass)
            }
        }
    }

    struct Shout;

    #[async_trait]
    impl InputGuardrailCheck for Shout {
        async fn check(&self, message: &Message, _ctx: &GuardrailContext<'_>) -> Result<InputVerdict> {
            Ok(InputVerdict::Rewrite(Message::user(
                message.text().unwrap_or_default().to_uppercase(),
            )))
        }
    }

    /// Plays a fixed list of verdicts, then passes.
    struct Script {
        verdicts: Vec<OutputVerdict>,
        calls: Arc<AtomicUsize>,
    }

    impl Script {
        fn new(verdicts: Vec<OutputVerdict>) -> Self {
            Self {
                verdicts,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl OutputGuardrailCheck for Script {
        async fn check(
            &self,
            _response: &ChatResponse,
            _ctx: &GuardrailContext<'_>,
        ) -> Result<OutputVerdict> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdicts.get(i).cloned().unwrap_or(OutputVerdict::Pass))
        }
    }

    struct Fixture {
        invocation: InvocationContext,
        variables: HashMap<String, String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                invocation: InvocationContext::for_tests("svc", "chat"),
                variables: HashMap::new(),
            }
        }

        fn ctx(&self) -> GuardrailContext<'_> {
            GuardrailContext {
                invocation: &self.invocation,
                memory: &[],
                augmentation: None,
                variables: &self.variables,
            }
        }
    }

    mod input {
        use super::*;

        #[tokio::test]
        async fn rewrites_chain_in_order() {
            let pipeline = GuardrailPipeline::new(
                vec![
                    InputGuardrail::new("shout", Shout),
                    InputGuardrail::new("block", Blocklist("HELLO")),
                ],
                Vec::new(),
                2,
            );
            let fixture = Fixture::new();
            let err = pipeline
                .check_input(Message::user("hello"), &fixture.ctx())
                .await
                .unwrap_err();
            match err {
                Error::InputGuardrailRejected { guardrail, .. } => assert_eq!(guardrail, "block"),
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn pass_keeps_message() {
            let pipeline = GuardrailPipeline::new(
                vec![InputGuardrail::new("block", Blocklist("secret"))],
                Vec::new(),
                2,
            );
            let fixture = Fixture::new();
            let message = pipeline
                .check_input(Message::user("hi"), &fixture.ctx())
                .await
                .unwrap();
            assert_eq!(message, Message::user("hi"));
        }
    }

    mod output {
        use super::*;

        #[tokio::test]
        async fn reprompt_stops_the_chain() {
            let second = Script::new(Vec::new());
            let second_calls = Arc::clone(&second.calls);
            let pipeline = GuardrailPipeline::new(
                Vec::new(),
                vec![
                    OutputGuardrail::new(
                        "format",
                        Script::new(vec![OutputVerdict::reprompt("not json", "Answer in JSON")]),
                    ),
                    OutputGuardrail::new("second", second),
                ],
                2,
            );
            let fixture = Fixture::new();
            let outcome = pipeline
                .check_output(ChatResponse::from_text("nope"), &fixture.ctx(), 1)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                OutputOutcome::Reprompt {
                    guardrail: "format".into(),
                    reason: "not json".into(),
                    message: Message::user("Answer in JSON"),
                }
            );
            assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn rewrite_then_pass() {
            let pipeline = GuardrailPipeline::new(
                Vec::new(),
                vec![OutputGuardrail::new(
                    "redact",
                    Script::new(vec![OutputVerdict::Rewrite(ChatResponse::from_text(
                        "[redacted]",
                    ))]),
                )],
                2,
            );
            let fixture = Fixture::new();
            let outcome = pipeline
                .check_output(ChatResponse::from_text("card 4242"), &fixture.ctx(), 1)
                .await
                .unwrap();
            assert_eq!(outcome, OutputOutcome::Pass(ChatResponse::from_text("[redacted]")));
        }

        #[tokio::test]
        async fn reject_is_fatal() {
            let pipeline = GuardrailPipeline::new(
                Vec::new(),
                vec![OutputGuardrail::new(
                    "policy",
                    Script::new(vec![OutputVerdict::Reject("off topic".into())]),
                )],
                2,
            );
            let fixture = Fixture::new();
            let err = pipeline
                .check_output(ChatResponse::from_text("x"), &fixture.ctx(), 1)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::OutputGuardrailRejected { attempts: 1, .. }));
        }
    }

    mod budget {
        use super::*;

        #[test]
        fn allows_max_retries_then_fails() {
            let pipeline = GuardrailPipeline::new(Vec::new(), Vec::new(), 2);
            let mut budget = pipeline.budget();
            let retry = OutputOutcome::Retry {
                guardrail: "g".into(),
                reason: "again".into(),
            };
            let last = ChatResponse::from_text("bad");

            budget.attempt();
            budget.spend(&retry, &last).unwrap();
            budget.attempt();
            budget.spend(&retry, &last).unwrap();
            budget.attempt();
            match budget.spend(&retry, &last).unwrap_err() {
                Error::OutputGuardrailRejected {
                    attempts,
                    last_response,
                    ..
                } => {
                    assert_eq!(attempts, 3);
                    assert_eq!(last_response.text().as_deref(), Some("bad"));
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[test]
        fn pass_costs_nothing() {
            let budget = GuardrailPipeline::new(Vec::new(), Vec::new(), 0).budget();
            budget
                .spend(&OutputOutcome::Pass(ChatResponse::default()), &ChatResponse::default())
                .unwrap();
            assert_eq!(budget.attempts(), 0);
        }
    }
}

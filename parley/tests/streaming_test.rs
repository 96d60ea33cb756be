//! Integration tests for streaming invocations.

#![allow(clippy::unwrap_used, clippy::panic, clippy::clone_on_ref_ptr)]

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parley::prelude::*;
use serde_json::json;

fn story_method() -> Descriptor {
    Descriptor::builder("story")
        .param(ParamSpec::unannotated("topic"))
        .returns(ReturnShape::Stream)
        .build()
        .unwrap()
}

fn service(provider: Arc<MockChatProvider>) -> AiService {
    AiService::builder("storyteller")
        .provider(provider)
        .memory_store(Arc::new(InMemoryChatMemoryStore::new()))
        .method(story_method())
        .build()
        .unwrap()
}

fn topic(text: &str) -> Args {
    Args::new().arg("topic", text)
}

fn roles(messages: &[Message]) -> Vec<Role> {
    messages.iter().map(|m| m.role).collect()
}

fn lookup() -> FnTool<impl Fn(serde_json::Value) -> Result<String, ToolError> + Send + Sync> {
    FnTool::new(
        ToolSpecification::new("lookup", "Looks up facts", json!({"type": "object"})),
        |_: serde_json::Value| Ok("dragons breathe fire".to_owned()),
    )
}

/// Sleeps before answering, long enough to cancel meanwhile.
struct SlowLookup;

#[async_trait]
impl ToolExecutor for SlowLookup {
    async fn execute(&self, _call: &ToolCall, _memory_id: &str) -> Result<String, ToolError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok("late fact".to_owned())
    }
}

/// Everything the handlers saw.
#[derive(Debug, Default)]
struct Seen {
    tokens: Vec<String>,
    completed: Vec<ChatResponse>,
    errors: Vec<String>,
}

type Shared = Arc<Mutex<Seen>>;

fn start(stream: TokenStream, seen: &Shared) -> parley::Result<StreamHandle> {
    let (partial, complete, error) = (seen.clone(), seen.clone(), seen.clone());
    stream
        .on_partial_response(move |token| partial.lock().unwrap().tokens.push(token.to_owned()))
        .on_complete(move |response| complete.lock().unwrap().completed.push(response))
        .on_error(move |err| error.lock().unwrap().errors.push(err.to_string()))
        .start()
}

mod delivery {
    use super::*;

    #[tokio::test]
    async fn tokens_arrive_in_order_then_completion() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_text("Once upon a time")
                .with_usage(Usage::new(5, 4)),
        );
        let service = service(provider.clone());
        let seen = Shared::default();

        let handle = start(service.invoke_streaming("story", topic("dragons")).unwrap(), &seen).unwrap();
        handle.wait().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.tokens.concat(), "Once upon a time");
        assert_eq!(seen.tokens.len(), 4);
        assert_eq!(seen.completed.len(), 1);
        assert_eq!(seen.completed[0].usage.unwrap().total_tokens, 9);
        assert!(seen.errors.is_empty());
        assert!(provider.requests().await[0].stream);
    }

    #[tokio::test]
    async fn streamed_answer_is_stored() {
        let provider = Arc::new(MockChatProvider::new().respond_text("The end"));
        let service = service(provider);
        let seen = Shared::default();

        start(service.invoke_streaming("story", topic("endings")).unwrap(), &seen)
            .unwrap()
            .wait()
            .await;

        let stored = service.memory("default").await.unwrap();
        let roles: Vec<_> = stored.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant]);
        assert_eq!(stored[1].text().as_deref(), Some("The end"));
    }

    #[tokio::test]
    async fn tool_turns_stream_again() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_tool_calls(vec![ToolCall::new("c1", "lookup", "{}")])
                .respond_text("They breathe fire"),
        );
        let service = AiService::builder("storyteller")
            .provider(provider.clone())
            .fn_tool(lookup())
            .method(story_method())
            .build()
            .unwrap();
        let seen = Shared::default();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let sink = executed.clone();

        let handle = service
            .invoke_streaming("story", topic("dragons"))
            .unwrap()
            .on_partial_response({
                let seen = seen.clone();
                move |token| seen.lock().unwrap().tokens.push(token.to_owned())
            })
            .on_tool_executed(move |execution| sink.lock().unwrap().push(execution.result.clone()))
            .ignore_errors()
            .start()
            .unwrap();
        handle.wait().await;

        assert_eq!(seen.lock().unwrap().tokens.concat(), "They breathe fire");
        assert_eq!(*executed.lock().unwrap(), ["dragons breathe fire"]);
        assert_eq!(provider.call_count().await, 2);
    }

    #[tokio::test]
    async fn immediate_return_completes_with_the_tool_turn() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_tool_calls(vec![ToolCall::new("c1", "lookup", "{}")])
                .with_usage(Usage::new(6, 2))
                .respond_text("never streamed"),
        );
        let service = AiService::builder("storyteller")
            .provider(provider.clone())
            .memory_store(Arc::new(InMemoryChatMemoryStore::new()))
            .fn_tool(lookup())
            .immediate_return("lookup")
            .method(story_method())
            .build()
            .unwrap();
        let seen = Shared::default();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let sink = executed.clone();

        let stream = service
            .invoke_streaming("story", topic("dragons"))
            .unwrap()
            .on_tool_executed(move |execution| sink.lock().unwrap().push(execution.result.clone()));
        start(stream, &seen).unwrap().wait().await;

        assert_eq!(provider.call_count().await, 1);
        assert_eq!(provider.remaining().await, 1);
        assert_eq!(*executed.lock().unwrap(), ["dragons breathe fire"]);
        let seen = seen.lock().unwrap();
        assert!(seen.tokens.is_empty());
        assert!(seen.errors.is_empty());
        assert_eq!(seen.completed.len(), 1);
        assert!(seen.completed[0].has_tool_calls());
        assert_eq!(seen.completed[0].usage.unwrap().total_tokens, 8);
        drop(seen);

        let stored = service.memory("default").await.unwrap();
        assert_eq!(roles(&stored), [Role::User, Role::Assistant, Role::Tool]);
        assert_eq!(stored[2].text().as_deref(), Some("dragons breathe fire"));
    }

    #[tokio::test]
    async fn moderation_flag_reaches_the_error_handler() {
        struct FlagEverything;

        #[async_trait]
        impl ModerationModel for FlagEverything {
            async fn moderate(&self, messages: &[Message]) -> parley::Result<Moderation> {
                let text = messages.last().and_then(Message::text).unwrap_or_default();
                Ok(Moderation::flagged(text))
            }
        }

        let provider = Arc::new(MockChatProvider::new().respond_text("A grim tale"));
        let service = AiService::builder("storyteller")
            .provider(provider.clone())
            .memory_store(Arc::new(InMemoryChatMemoryStore::new()))
            .moderation_model(Arc::new(FlagEverything))
            .method(
                Descriptor::builder("story")
                    .param(ParamSpec::unannotated("topic"))
                    .returns(ReturnShape::Stream)
                    .moderate()
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let seen = Shared::default();

        start(service.invoke_streaming("story", topic("something nasty")).unwrap(), &seen)
            .unwrap()
            .wait()
            .await;

        let seen = seen.lock().unwrap();
        assert!(seen.completed.is_empty());
        assert_eq!(seen.errors.len(), 1);
        assert!(seen.errors[0].contains("flagged by moderation: something nasty"));
        drop(seen);
        let stored = service.memory("default").await.unwrap();
        assert_eq!(roles(&stored), [Role::User]);
    }

    #[tokio::test]
    async fn tool_turn_handlers_fire_in_order() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_tool_calls(vec![ToolCall::new("c1", "lookup", "{}")])
                .respond_text("They breathe fire"),
        );
        let service = AiService::builder("storyteller")
            .provider(provider)
            .fn_tool(lookup())
            .method(story_method())
            .build()
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::<String>::new()));
        let (intermediate, before, after, complete) =
            (events.clone(), events.clone(), events.clone(), events.clone());

        service
            .invoke_streaming("story", topic("dragons"))
            .unwrap()
            .on_partial_response(|_| {})
            .on_intermediate_response(move |response| {
                let names: Vec<_> = response.tool_calls().iter().map(|c| c.name.clone()).collect();
                intermediate.lock().unwrap().push(format!("intermediate:{}", names.join(",")));
            })
            .before_tool_execution(move |call| before.lock().unwrap().push(format!("before:{}", call.id)))
            .on_tool_executed(move |execution| {
                after.lock().unwrap().push(format!("executed:{}", execution.request.id));
            })
            .on_complete(move |_| complete.lock().unwrap().push("complete".to_owned()))
            .ignore_errors()
            .start()
            .unwrap()
            .wait()
            .await;

        assert_eq!(
            *events.lock().unwrap(),
            ["intermediate:lookup", "before:c1", "executed:c1", "complete"]
        );
    }

    #[tokio::test]
    async fn errors_go_to_the_handler() {
        let provider = Arc::new(MockChatProvider::new().fail(LlmError::network("connection reset")));
        let service = service(provider);
        let seen = Shared::default();

        let handle = start(service.invoke_streaming("story", topic("x")).unwrap(), &seen).unwrap();
        handle.wait().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.errors.len(), 1);
        assert!(seen.errors[0].contains("connection reset"));
        assert!(seen.completed.is_empty());
    }

    #[tokio::test]
    async fn stream_error_chunk_fails_the_turn() {
        let provider = Arc::new(
            MockChatProvider::new().stream(vec![StreamChunk::text("Once "), StreamChunk::error("overloaded")]),
        );
        let service = service(provider);
        let seen = Shared::default();

        start(service.invoke_streaming("story", topic("x")).unwrap(), &seen)
            .unwrap()
            .wait()
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.tokens, ["Once "]);
        assert!(seen.errors[0].contains("overloaded"));
    }
}

mod handlers {
    use super::*;

    #[tokio::test]
    async fn zero_partial_handlers_fail_before_any_call() {
        let provider = Arc::new(MockChatProvider::new().respond_text("unused"));
        let service = service(provider.clone());

        let result = service
            .invoke_streaming("story", topic("x"))
            .unwrap()
            .ignore_errors()
            .start();

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(provider.call_count().await, 0);
    }

    #[tokio::test]
    async fn two_partial_handlers_fail_before_any_call() {
        let provider = Arc::new(MockChatProvider::new().respond_text("unused"));
        let service = service(provider.clone());

        let result = service
            .invoke_streaming("story", topic("x"))
            .unwrap()
            .on_partial_response(|_| {})
            .on_partial_response(|_| {})
            .ignore_errors()
            .start();

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(provider.call_count().await, 0);
    }

    #[tokio::test]
    async fn blocking_methods_cannot_stream() {
        let service = AiService::builder("assistant")
            .provider(Arc::new(MockChatProvider::new()))
            .method(
                Descriptor::builder("chat")
                    .param(ParamSpec::unannotated("message"))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        assert!(matches!(
            service.invoke_streaming("chat", Args::new().arg("message", "hi")),
            Err(Error::Configuration(_))
        ));
    }
}

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn cancel_before_first_token_delivers_nothing() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_text("a long story about many things")
                .with_chunk_delay(Duration::from_millis(20)),
        );
        let service = service(provider);
        let seen = Shared::default();

        let handle = start(service.invoke_streaming("story", topic("x")).unwrap(), &seen).unwrap();
        handle.cancel().unwrap();
        handle.wait().await;

        assert!(handle.is_cancelled());
        let seen = seen.lock().unwrap();
        assert!(seen.tokens.is_empty());
        assert!(seen.completed.is_empty());
        assert!(seen.errors.is_empty());
    }

    #[tokio::test]
    async fn cancel_mid_stream_stops_tokens() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_text("one two three four five six seven eight")
                .with_chunk_delay(Duration::from_millis(30)),
        );
        let service = service(provider);
        let seen = Shared::default();

        let handle = start(service.invoke_streaming("story", topic("x")).unwrap(), &seen).unwrap();
        tokio::time::sleep(Duration::from_millis(75)).await;
        handle.cancel().unwrap();
        let delivered = seen.lock().unwrap().tokens.len();
        handle.wait().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.tokens.len(), delivered);
        assert!(seen.tokens.len() < 8);
        assert!(seen.completed.is_empty());
    }

    #[tokio::test]
    async fn cancel_from_a_handler_stops_at_once() {
        let provider = Arc::new(MockChatProvider::new().respond_text("one two three four"));
        let service = service(provider);
        let seen = Shared::default();
        let slot: Arc<OnceLock<StreamHandle>> = Arc::new(OnceLock::new());

        let handle = service
            .invoke_streaming("story", topic("x"))
            .unwrap()
            .on_partial_response({
                let seen = seen.clone();
                let slot = slot.clone();
                move |token| {
                    seen.lock().unwrap().tokens.push(token.to_owned());
                    slot.get().unwrap().cancel().unwrap();
                }
            })
            .on_complete({
                let seen = seen.clone();
                move |response| seen.lock().unwrap().completed.push(response)
            })
            .ignore_errors()
            .start()
            .unwrap();
        slot.set(handle).unwrap();
        slot.get().unwrap().wait().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.tokens, ["one "]);
        assert!(seen.completed.is_empty());
    }

    #[tokio::test]
    async fn cancel_during_a_tool_stores_nothing_of_the_turn() {
        let provider = Arc::new(
            MockChatProvider::new()
                .respond_tool_calls(vec![ToolCall::new("c1", "lookup", "{}")])
                .respond_text("never requested"),
        );
        let service = AiService::builder("storyteller")
            .provider(provider.clone())
            .memory_store(Arc::new(InMemoryChatMemoryStore::new()))
            .tool_executor(
                ToolSpecification::new("lookup", "Looks up facts slowly", json!({"type": "object"})),
                Arc::new(SlowLookup),
            )
            .method(story_method())
            .build()
            .unwrap();
        let seen = Shared::default();
        let executed = Arc::new(Mutex::new(0_usize));
        let sink = executed.clone();

        let stream = service
            .invoke_streaming("story", topic("x"))
            .unwrap()
            .on_tool_executed(move |_| *sink.lock().unwrap() += 1);
        let handle = start(stream, &seen).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.cancel().unwrap();
        handle.wait().await;

        assert_eq!(provider.call_count().await, 1);
        assert_eq!(*executed.lock().unwrap(), 0);
        let seen = seen.lock().unwrap();
        assert!(seen.completed.is_empty());
        assert!(seen.errors.is_empty());
        drop(seen);
        let stored = service.memory("default").await.unwrap();
        assert_eq!(roles(&stored), [Role::User]);
    }

    #[tokio::test]
    async fn unsupported_cancel_is_an_error() {
        let provider = Arc::new(MockChatProvider::new().respond_text("short").without_cancellation());
        let service = service(provider);
        let seen = Shared::default();

        let handle = start(service.invoke_streaming("story", topic("x")).unwrap(), &seen).unwrap();

        assert!(matches!(handle.cancel(), Err(Error::Cancellation(_))));
        assert!(!handle.is_cancelled());
        handle.wait().await;
        assert_eq!(seen.lock().unwrap().completed.len(), 1);
    }
}

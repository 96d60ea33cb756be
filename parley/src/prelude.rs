//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust,ignore
//! use parley::prelude::*;
//! ```

pub use crate::assembler::{AssembledMessages, MessageAssembler, SystemMessageProvider};
pub use crate::chat::{
    ChatProvider, ChatRequest, ChatRequestTransformer, ChatResponse, ResponseFormat, SharedChatProvider,
};
pub use crate::config::ServiceConfig;
pub use crate::descriptor::{Descriptor, DescriptorBuilder, ParamRole, ParamSpec, ReturnShape};
pub use crate::error::{Error, LlmError, LlmErrorKind, Result, ToolError};
pub use crate::executor::{SharedTaskExecutor, TaskExecutor, WorkerPool};
pub use crate::guardrail::{
    GuardrailContext, InputGuardrail, InputGuardrailCheck, InputVerdict, OutputGuardrail,
    OutputGuardrailCheck, OutputVerdict,
};
pub use crate::listener::{InvocationListener, LogLevel, LoggingListener, SharedInvocationListener};
pub use crate::memory::{ChatMemoryStore, InMemoryChatMemoryStore, SharedChatMemoryStore};
pub use crate::message::{Content, Message, Role, ToolCall};
pub use crate::mock::MockChatProvider;
pub use crate::moderation::{Moderation, ModerationModel, SharedModerationModel};
pub use crate::output::{
    JsonOutputParser, Output, OutputSchema, ServiceResult, StructuredOutputParser,
};
pub use crate::retrieval::{
    AugmentationRequest, AugmentationResult, RetrievalAugmentor, RetrievedContent,
    SharedRetrievalAugmentor,
};
pub use crate::service::{AiService, AiServiceBuilder, Args, InvocationContext, Mode};
pub use crate::stream::{ChatStream, StopReason, StreamAggregator, StreamChunk};
pub use crate::streaming::{StreamHandle, TokenStream};
pub use crate::template::{DefaultRenderer, Scalar, TemplateValue, VariableRenderer};
pub use crate::tool::{
    AggregateResult, FnTool, HallucinatedToolStrategy, SharedToolExecutor, SharedToolProvider, Tool,
    ToolErrorContext, ToolErrorHandler, ToolErrorOutcome, ToolExecution, ToolExecutor, ToolProvider,
    ToolProviderRequest, ToolProviderResult, ToolSpecification, parameters_for,
};
pub use crate::usage::Usage;

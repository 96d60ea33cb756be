//! The AI service: a validated dispatch table over one model executor.
//!
//! An [`AiService`] is built once by [`AiServiceBuilder`] from method
//! [`Descriptor`]s. Building validates every descriptor against the rest of
//! the configuration; a built service is immutable and cheap to clone.
//!
//! Callers reach methods by name through [`AiService::invoke`] and
//! [`AiService::invoke_streaming`]. A typed facade is a thin hand-written
//! adapter over these two calls:
//!
//! ```rust,ignore
//! struct Translator(AiService);
//!
//! impl Translator {
//!     async fn translate(&self, text: &str, language: &str) -> parley::Result<String> {
//!         let args = Args::new().arg("text", text).arg("language", language);
//!         let output = self.0.invoke("translate", args).await?;
//!         Ok(output.text().unwrap_or_default().to_owned())
//!     }
//! }
//! ```
//!
//! # Concurrency
//!
//! Invocations run on the caller's task. Two invocations sharing a memory id
//! must not run at the same time: there is no per-conversation locking and
//! their messages would interleave.

mod builder;
mod context;
mod dispatch;

pub use builder::AiServiceBuilder;
pub use context::{Args, InvocationContext};
pub use dispatch::Mode;
pub(crate) use dispatch::{DispatchTable, Prepared, Route};

use std::fmt;
use std::sync::Arc;

use tracing::{Instrument, info_span};

use crate::assembler::MessageAssembler;
use crate::chat::{ChatRequestTransformer, SharedChatProvider};
use crate::config::ServiceConfig;
use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::executor::SharedTaskExecutor;
use crate::listener::ListenerSet;
use crate::memory::SharedChatMemoryStore;
use crate::message::Message;
use crate::moderation::SharedModerationModel;
use crate::output::{Output, OutputMapper};
use crate::retrieval::SharedRetrievalAugmentor;
use crate::streaming::{StreamJob, TokenStream};
use crate::tool::{SharedToolProvider, ToolPolicy, ToolRegistry};

/// Shared state of a built service.
pub(crate) struct ServiceInner {
    pub(crate) name: String,
    pub(crate) provider: SharedChatProvider,
    pub(crate) memory: Option<SharedChatMemoryStore>,
    pub(crate) tools: ToolRegistry,
    pub(crate) tool_provider: Option<SharedToolProvider>,
    pub(crate) policy: ToolPolicy,
    pub(crate) augmentor: Option<SharedRetrievalAugmentor>,
    pub(crate) moderation: Option<SharedModerationModel>,
    pub(crate) listeners: ListenerSet,
    pub(crate) executor: SharedTaskExecutor,
    pub(crate) assembler: MessageAssembler,
    pub(crate) mapper: OutputMapper,
    pub(crate) config: ServiceConfig,
    pub(crate) request_transformer: Option<ChatRequestTransformer>,
    pub(crate) routes: DispatchTable,
}

/// A built AI service.
#[derive(Clone)]
pub struct AiService {
    inner: Arc<ServiceInner>,
}

impl AiService {
    /// Start building a service named `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> AiServiceBuilder {
        AiServiceBuilder::new(name)
    }

    /// Name of the service.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The validated settings.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Names of all methods.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.inner.routes.methods()
    }

    /// The descriptor of `method`.
    #[must_use]
    pub fn descriptor(&self, method: &str) -> Option<&Descriptor> {
        self.inner.routes.get(method).map(|r| r.descriptor.as_ref())
    }

    /// How `method` delivers its answer.
    #[must_use]
    pub fn mode(&self, method: &str) -> Option<Mode> {
        self.inner.routes.get(method).map(|r| r.mode)
    }

    /// Call a method and wait for its mapped output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unknown methods, streaming
    /// methods and malformed arguments before anything is sent. Later
    /// failures follow the error taxonomy of [`Error`].
    pub async fn invoke(&self, method: &str, args: Args) -> Result<Output> {
        let route = self.inner.routes.route(method, Mode::Blocking)?;
        let invocation = self.inner.invocation(&route, method, args)?;
        let span = info_span!(
            "invocation",
            id = %invocation.id(),
            service = %invocation.service(),
            method = %invocation.method(),
            memory_id = %invocation.memory_id(),
        );
        self.inner
            .invoke_blocking(&route, &invocation)
            .instrument(span)
            .await
    }

    /// Prepare a streaming call. Register handlers on the returned
    /// [`TokenStream`] and start it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] for unknown or non-streaming methods
    /// and malformed arguments, and [`Error::MessageTemplate`] when the
    /// messages cannot be assembled. Nothing is sent in either case.
    pub fn invoke_streaming(&self, method: &str, args: Args) -> Result<TokenStream> {
        let route = self.inner.routes.route(method, Mode::Streaming)?;
        let invocation = self.inner.invocation(&route, method, args)?;
        let assembled = self.inner.assembler.assemble(&route.descriptor, &invocation)?;
        Ok(TokenStream::new(StreamJob {
            service: Arc::clone(&self.inner),
            route,
            invocation,
            assembled,
        }))
    }

    /// Read the conversation stored under `memory_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the service has no memory store.
    pub async fn memory(&self, memory_id: &str) -> Result<Vec<Message>> {
        self.memory_store()?.read(memory_id).await
    }

    /// Remove the conversation stored under `memory_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the service has no memory store.
    pub async fn clear_memory(&self, memory_id: &str) -> Result<()> {
        self.memory_store()?.clear(memory_id).await
    }

    fn memory_store(&self) -> Result<&SharedChatMemoryStore> {
        self.inner
            .memory
            .as_ref()
            .ok_or_else(|| Error::configuration(format!("service '{}' has no chat memory", self.inner.name)))
    }
}

impl fmt::Debug for AiService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AiService")
            .field("name", &self.inner.name)
            .field("provider", &self.inner.provider.provider_name())
            .field("methods", &self.inner.routes.len())
            .field("tools", &self.inner.tools)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

//! Parley - declarative AI services over chat models
//!
//! A service is a set of named methods, each described by a [`Descriptor`]:
//! prompt templates, parameter roles, a return shape, the tools it may use
//! and its guardrails. [`AiServiceBuilder`] validates the descriptors against
//! the configured components once; the built [`AiService`] then assembles
//! messages, runs input guardrails, drives the tool loop, checks the answer
//! with output guardrails and maps it to the declared shape.
//!
//! Streaming methods return a [`TokenStream`] that delivers tokens to
//! callbacks and can be cancelled through its [`StreamHandle`].
//!
//! [`Descriptor`]: descriptor::Descriptor
//! [`TokenStream`]: streaming::TokenStream
//! [`StreamHandle`]: streaming::StreamHandle

pub mod assembler;
pub mod chat;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod executor;
pub mod guardrail;
pub mod listener;
pub mod memory;
pub mod message;
pub mod mock;
pub mod moderation;
pub mod output;
pub mod prelude;
pub mod retrieval;
pub mod service;
pub mod stream;
pub mod streaming;
pub mod template;
pub mod tool;
pub mod usage;

pub use error::{Error, LlmError, Result, ToolError};
pub use service::{AiService, AiServiceBuilder, Args, InvocationContext};

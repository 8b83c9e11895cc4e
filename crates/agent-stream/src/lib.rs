//! Streaming layer for LLM agent runs.
//!
//! Raw model chunks (text, reasoning, partial tool calls, usage) are turned
//! into an ordered sequence of step-scoped events, dispatched synchronously to
//! registered handlers and folded into final content and usage.
//!
//! # Processing a chunk stream
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agent_stream::prelude::*;
//!
//! # async fn demo(
//! #     chunks: impl futures::Stream<Item = Result<RawChunk, StreamError>>,
//! # ) -> Result<(), StreamError> {
//! let registry = ProviderRegistry::with_builtins();
//! let profile = registry.resolve("openai")?;
//!
//! let content = ContentAggregator::new();
//! let usage = MetadataAggregator::new(profile.usage_mode);
//! let mut dispatcher = EventDispatcher::new();
//! content.attach(&mut dispatcher);
//! usage.attach(&mut dispatcher);
//!
//! let processor = RunProcessor::new(&StreamConfig::from_env()?, profile, dispatcher)?;
//! let summary = processor.run(chunks, None).await?;
//!
//! let parts = content.get_result().map_err(|e| StreamError::producer(e.to_string()))?;
//! println!("{} tool calls, text: {}", summary.tool_calls.len(), joined_text(&parts));
//! # Ok(())
//! # }
//! ```

/// Run-scoped content and usage aggregation.
pub mod aggregate;
/// Stream options and environment overrides.
pub mod config;
/// Inbound chunk shapes and outbound content parts.
pub mod content;
/// Tool-call fragment assembly.
pub mod correlator;
/// Event handler registry.
pub mod dispatch;
/// Public error types.
pub mod errors;
/// Step-scoped stream events.
pub mod events;
/// Process-wide tracing setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Provider variants and their stream policies.
pub mod provider;
/// Per-run processing and the turn driver.
pub mod run;
/// Workflow-graph node contract.
pub mod runnable;
/// Text and reasoning classification.
pub mod splitter;
/// Per-run step ledger.
pub mod steps;
/// Tool execution node.
pub mod tools;
/// SSE decoding for OpenAI-compatible streams.
pub mod transport;

pub use aggregate::{ContentAggregator, MetadataAggregator, UsageMode};
pub use config::{ReasoningKey, StreamConfig};
pub use content::{
    ContentPart, MessageContent, RawChunk, ToolCall, ToolCallChunk, UsageMetadata, joined_text,
};
pub use dispatch::{EventDispatcher, EventHandler, EventLog};
pub use errors::{AggregateError, RunFailure, StreamError};
pub use events::{EventKind, RunOutcome, RunStep, StepType, StreamEvent, ToolEndEvent};
pub use observability::init_observability;
pub use provider::{Capabilities, ProviderKind, ProviderProfile, ProviderRegistry};
pub use run::{RunProcessor, RunSummary};
pub use runnable::{Runnable, RunnableCallable, RunnableConfig};
pub use tools::{Tool, ToolDispatchNode, ToolError};

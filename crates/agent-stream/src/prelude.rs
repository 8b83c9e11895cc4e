//! Common imports for typical usage.
//!
//! Exports the types needed to process a run and collect its results so
//! application code needs fewer import lines.
pub use crate::{
    AggregateError, ContentAggregator, ContentPart, EventDispatcher, EventKind, MetadataAggregator,
    ProviderRegistry, RawChunk, RunOutcome, RunProcessor, RunSummary, Runnable, RunnableConfig,
    StreamConfig, StreamError, StreamEvent, Tool, ToolDispatchNode, ToolError, joined_text,
};

use serde::{Deserialize, Serialize};

use crate::content::AdditionalFields;
use crate::errors::StreamError;

/// Which additional field carries reasoning text for the provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningKey {
    #[default]
    Reasoning,
    ReasoningContent,
}

impl ReasoningKey {
    /// Reads the configured field, treating empty strings as absent.
    pub fn read<'a>(&self, fields: &'a AdditionalFields) -> Option<&'a str> {
        let value = match self {
            ReasoningKey::Reasoning => fields.reasoning.as_deref(),
            ReasoningKey::ReasoningContent => fields.reasoning_content.as_deref(),
        };
        value.filter(|text| !text.is_empty())
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reasoning" => Some(ReasoningKey::Reasoning),
            "reasoning_content" => Some(ReasoningKey::ReasoningContent),
            _ => None,
        }
    }
}

/// Per-run streaming options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Minimum buffered characters before a delta is dispatched.
    #[serde(default = "default_block_threshold")]
    pub block_threshold: usize,
    /// Reuse the message id when the step type switches.
    #[serde(default)]
    pub accumulate: bool,
    #[serde(default)]
    pub reasoning_key: ReasoningKey,
    /// Convert tool failures into error content instead of failing the run.
    #[serde(default = "default_handle_tool_errors")]
    pub handle_tool_errors: bool,
}

pub const DEFAULT_BLOCK_THRESHOLD: usize = 8;

const fn default_block_threshold() -> usize {
    DEFAULT_BLOCK_THRESHOLD
}

const fn default_handle_tool_errors() -> bool {
    true
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            block_threshold: default_block_threshold(),
            accumulate: false,
            reasoning_key: ReasoningKey::default(),
            handle_tool_errors: default_handle_tool_errors(),
        }
    }
}

pub(crate) fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

impl StreamConfig {
    /// Minimum characters per emitted delta.
    pub fn block_threshold(mut self, threshold: usize) -> Self {
        self.block_threshold = threshold;
        self
    }

    /// Reuse one message id across TEXT and REASONING steps.
    pub fn accumulate(mut self, accumulate: bool) -> Self {
        self.accumulate = accumulate;
        self
    }

    /// Field the provider carries reasoning text in.
    pub fn reasoning_key(mut self, key: ReasoningKey) -> Self {
        self.reasoning_key = key;
        self
    }

    /// Turn tool failures into error content instead of failing the run.
    pub fn handle_tool_errors(mut self, handle: bool) -> Self {
        self.handle_tool_errors = handle;
        self
    }

    /// Defaults overridden by `AGENT_STREAM_*` environment variables.
    ///
    /// - `AGENT_STREAM_BLOCK_THRESHOLD`: positive integer.
    /// - `AGENT_STREAM_ACCUMULATE`: boolean.
    /// - `AGENT_STREAM_REASONING_KEY`: `reasoning` or `reasoning_content`.
    /// - `AGENT_STREAM_HANDLE_TOOL_ERRORS`: boolean.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StreamError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("AGENT_STREAM_BLOCK_THRESHOLD") {
            config.block_threshold = raw.trim().parse().map_err(|e| {
                StreamError::Config(format!("invalid AGENT_STREAM_BLOCK_THRESHOLD {raw:?}: {e}"))
            })?;
        }
        if let Some(raw) = lookup("AGENT_STREAM_ACCUMULATE") {
            config.accumulate = parse_bool_env(&raw).ok_or_else(|| {
                StreamError::Config(format!("invalid AGENT_STREAM_ACCUMULATE {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup("AGENT_STREAM_REASONING_KEY") {
            config.reasoning_key = ReasoningKey::parse(&raw).ok_or_else(|| {
                StreamError::Config(format!("invalid AGENT_STREAM_REASONING_KEY {raw:?}"))
            })?;
        }
        if let Some(raw) = lookup("AGENT_STREAM_HANDLE_TOOL_ERRORS") {
            config.handle_tool_errors = parse_bool_env(&raw).ok_or_else(|| {
                StreamError::Config(format!("invalid AGENT_STREAM_HANDLE_TOOL_ERRORS {raw:?}"))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects options the splitter cannot work with.
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.block_threshold == 0 {
            return Err(StreamError::Config(
                "block_threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Errors produced while configuring or processing a run.
///
/// Recoverable variants (`StreamDesync`, `MalformedToolArgs`) are recorded as
/// diagnostics by the run processor and never abort a run. The remaining
/// variants are fatal unless downgraded by `handle_tool_errors`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Requested provider has no registered profile.
    #[error("unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },
    /// The same provider name was registered twice.
    #[error("duplicate provider registration: {provider}")]
    DuplicateProvider { provider: String },
    /// Invalid stream or tool configuration.
    #[error("config error: {0}")]
    Config(String),
    /// A delta referenced a step that is unknown or already closed.
    #[error("stream desync: {kind} for unknown or closed step {step_id}")]
    StreamDesync { step_id: String, kind: String },
    /// Accumulated tool-call arguments failed to parse.
    #[error("malformed tool arguments for call {call_id} ({name}): {message}")]
    MalformedToolArgs {
        call_id: String,
        name: String,
        message: String,
    },
    /// No tool implementation resolved for the requested name.
    #[error("unknown tool: {name}")]
    UnknownTool { name: String },
    /// A tool implementation failed.
    #[error("tool {name} failed: {message}")]
    ToolExecution { name: String, message: String },
    /// The upstream chunk producer failed.
    #[error("producer error: {0}")]
    Producer(String),
}

impl StreamError {
    /// Creates a producer-level error.
    pub fn producer(message: impl Into<String>) -> Self {
        Self::Producer(message.into())
    }

    /// Returns true for errors that only degrade output and never end a run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StreamDesync { .. } | Self::MalformedToolArgs { .. }
        )
    }
}

/// Terminal run failure carried by `RUN_END` and returned by aggregators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum RunFailure {
    /// The upstream producer failed mid-stream.
    #[error("producer failure: {message}")]
    Producer { message: String },
    /// A tool failed and tool errors were not handled.
    #[error("tool failure ({name}): {message}")]
    Tool { name: String, message: String },
    /// Configuration was rejected after the run started.
    #[error("config failure: {message}")]
    Config { message: String },
}

impl From<&StreamError> for RunFailure {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::UnknownTool { name } => RunFailure::Tool {
                name: name.clone(),
                message: err.to_string(),
            },
            StreamError::ToolExecution { name, message } => RunFailure::Tool {
                name: name.clone(),
                message: message.clone(),
            },
            StreamError::UnsupportedProvider { .. }
            | StreamError::DuplicateProvider { .. }
            | StreamError::Config(_) => RunFailure::Config {
                message: err.to_string(),
            },
            StreamError::Producer(message) => RunFailure::Producer {
                message: message.clone(),
            },
            StreamError::StreamDesync { .. } | StreamError::MalformedToolArgs { .. } => {
                RunFailure::Producer {
                    message: err.to_string(),
                }
            }
        }
    }
}

/// Why an aggregator could not return a final result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    /// The run has not dispatched its terminal event yet.
    #[error("run incomplete")]
    Incomplete,
    /// The run ended in failure; no partial result is returned.
    #[error(transparent)]
    Failed(RunFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(
            StreamError::StreamDesync {
                step_id: "s".into(),
                kind: "message_delta".into()
            }
            .is_recoverable()
        );
        assert!(!StreamError::UnknownTool { name: "x".into() }.is_recoverable());
    }

    #[test]
    fn tool_errors_map_to_tool_failure() {
        let failure = RunFailure::from(&StreamError::ToolExecution {
            name: "calc".into(),
            message: "boom".into(),
        });
        assert_eq!(
            failure,
            RunFailure::Tool {
                name: "calc".into(),
                message: "boom".into()
            }
        );
    }
}

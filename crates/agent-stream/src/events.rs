use std::fmt;

use serde::{Deserialize, Serialize};

use crate::content::{ContentPart, ToolCall, ToolCallChunk, UsageMetadata};
use crate::errors::RunFailure;

/// Kind of output a step carries. A step keeps one type for its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Text,
    Reasoning,
    ToolCall,
}

impl StepType {
    /// Lowercase name used in step keys.
    pub fn as_str(self) -> &'static str {
        match self {
            StepType::Text => "text",
            StepType::Reasoning => "reasoning",
            StepType::ToolCall => "tool_call",
        }
    }
}

/// Addressable unit of output within a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: String,
    pub run_id: uuid::Uuid,
    pub step_type: StepType,
    pub message_id: String,
    /// Monotonic per run, never reused.
    pub index: u32,
}

/// Event-type tag used to route events to handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    RunStepCreated,
    RunStepClosed,
    MessageDelta,
    ReasoningDelta,
    ToolCallChunk,
    ToolEnd,
    ModelEnd,
    Usage,
    RunEnd,
}

impl EventKind {
    /// Every tag, in dispatch-table order.
    pub const ALL: [EventKind; 9] = [
        EventKind::RunStepCreated,
        EventKind::RunStepClosed,
        EventKind::MessageDelta,
        EventKind::ReasoningDelta,
        EventKind::ToolCallChunk,
        EventKind::ToolEnd,
        EventKind::ModelEnd,
        EventKind::Usage,
        EventKind::RunEnd,
    ];

    /// Upper-case tag name.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::RunStepCreated => "RUN_STEP_CREATED",
            EventKind::RunStepClosed => "RUN_STEP_CLOSED",
            EventKind::MessageDelta => "MESSAGE_DELTA",
            EventKind::ReasoningDelta => "REASONING_DELTA",
            EventKind::ToolCallChunk => "TOOL_CALL_CHUNK",
            EventKind::ToolEnd => "TOOL_END",
            EventKind::ModelEnd => "MODEL_END",
            EventKind::Usage => "USAGE",
            EventKind::RunEnd => "RUN_END",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted once per completed or failed tool execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolEndEvent {
    pub step_id: String,
    pub tool_call: ToolCall,
    /// Position of this call within its step's content.
    pub content_index: usize,
    pub output: String,
    pub is_error: bool,
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    Completed,
    Failed(RunFailure),
}

/// Structured, step-scoped events dispatched for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    RunStepCreated {
        step: RunStep,
    },
    RunStepClosed {
        run_id: uuid::Uuid,
        step_id: String,
    },
    /// Text or artifact content for a text step.
    MessageDelta {
        step_id: String,
        part: ContentPart,
    },
    ReasoningDelta {
        step_id: String,
        text: String,
    },
    ToolCallChunk {
        step_id: String,
        content_index: usize,
        chunk: ToolCallChunk,
    },
    ToolEnd(ToolEndEvent),
    Usage {
        run_id: uuid::Uuid,
        usage: UsageMetadata,
    },
    /// End of one model generation; all its steps are already closed.
    ModelEnd {
        run_id: uuid::Uuid,
        finish_reason: Option<String>,
    },
    /// Terminal event of the run, dispatched exactly once.
    RunEnd {
        run_id: uuid::Uuid,
        outcome: RunOutcome,
    },
}

impl StreamEvent {
    /// Tag handlers are registered under.
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::RunStepCreated { .. } => EventKind::RunStepCreated,
            StreamEvent::RunStepClosed { .. } => EventKind::RunStepClosed,
            StreamEvent::MessageDelta { .. } => EventKind::MessageDelta,
            StreamEvent::ReasoningDelta { .. } => EventKind::ReasoningDelta,
            StreamEvent::ToolCallChunk { .. } => EventKind::ToolCallChunk,
            StreamEvent::ToolEnd(_) => EventKind::ToolEnd,
            StreamEvent::Usage { .. } => EventKind::Usage,
            StreamEvent::ModelEnd { .. } => EventKind::ModelEnd,
            StreamEvent::RunEnd { .. } => EventKind::RunEnd,
        }
    }

    /// Step the event belongs to, if it is step-scoped.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            StreamEvent::RunStepCreated { step } => Some(&step.id),
            StreamEvent::RunStepClosed { step_id, .. }
            | StreamEvent::MessageDelta { step_id, .. }
            | StreamEvent::ReasoningDelta { step_id, .. }
            | StreamEvent::ToolCallChunk { step_id, .. } => Some(step_id),
            StreamEvent::ToolEnd(end) => Some(&end.step_id),
            StreamEvent::Usage { .. } | StreamEvent::ModelEnd { .. } | StreamEvent::RunEnd { .. } => {
                None
            }
        }
    }

    /// True for content deltas, which require an open step.
    pub fn is_delta(&self) -> bool {
        matches!(
            self,
            StreamEvent::MessageDelta { .. }
                | StreamEvent::ReasoningDelta { .. }
                | StreamEvent::ToolCallChunk { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        let event = StreamEvent::ReasoningDelta {
            step_id: "step_1".into(),
            text: "x".into(),
        };
        assert_eq!(event.kind(), EventKind::ReasoningDelta);
        assert_eq!(event.kind().to_string(), "REASONING_DELTA");
        assert!(event.is_delta());
        assert_eq!(event.step_id(), Some("step_1"));
    }

    #[test]
    fn run_end_is_not_step_scoped() {
        let event = StreamEvent::RunEnd {
            run_id: uuid::Uuid::new_v4(),
            outcome: RunOutcome::Completed,
        };
        assert_eq!(event.step_id(), None);
        assert!(!event.is_delta());
    }
}

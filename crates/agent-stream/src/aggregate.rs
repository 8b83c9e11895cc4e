//! Run-scoped folds over dispatched events.
//!
//! Both aggregators are cheap handles around shared fold state so one clone
//! can be registered with the dispatcher while another is kept to pull the
//! result after the run's terminal event.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::content::{ContentPart, UsageMetadata};
use crate::dispatch::{EventDispatcher, EventHandler, lock};
use crate::errors::AggregateError;
use crate::events::{EventKind, RunOutcome, StreamEvent, ToolEndEvent};

fn outcome_result<T>(outcome: &Option<RunOutcome>, value: impl FnOnce() -> T) -> Result<T, AggregateError> {
    match outcome {
        None => Err(AggregateError::Incomplete),
        Some(RunOutcome::Failed(failure)) => Err(AggregateError::Failed(failure.clone())),
        Some(RunOutcome::Completed) => Ok(value()),
    }
}

#[derive(Default)]
struct ContentState {
    step_index: HashMap<String, u32>,
    /// Keyed by `(step index, content index)`.
    parts: BTreeMap<(u32, usize), ContentPart>,
    next_slot: HashMap<String, usize>,
    /// Slot of the part that text deltas for the step currently append to.
    open_slot: HashMap<String, usize>,
    outcome: Option<RunOutcome>,
}

impl ContentState {
    fn allocate(&mut self, step_id: &str) -> usize {
        let next = self.next_slot.entry(step_id.to_string()).or_insert(0);
        let slot = *next;
        *next = slot.saturating_add(1);
        slot
    }

    fn append_text(&mut self, step_id: &str, text: &str, reasoning: bool) {
        let Some(&index) = self.step_index.get(step_id) else {
            return;
        };
        let slot = match self.open_slot.get(step_id).copied() {
            Some(slot) => slot,
            None => {
                let slot = self.allocate(step_id);
                self.open_slot.insert(step_id.to_string(), slot);
                slot
            }
        };
        let part = self.parts.entry((index, slot)).or_insert_with(|| {
            if reasoning {
                ContentPart::Reasoning {
                    text: String::new(),
                }
            } else {
                ContentPart::text("")
            }
        });
        if let ContentPart::Text { text: existing } | ContentPart::Reasoning { text: existing } =
            part
        {
            existing.push_str(text);
        }
    }

    fn push_artifact(&mut self, step_id: &str, value: &serde_json::Value) {
        let Some(&index) = self.step_index.get(step_id) else {
            return;
        };
        let slot = self.allocate(step_id);
        self.open_slot.remove(step_id);
        self.parts.insert(
            (index, slot),
            ContentPart::Artifact {
                value: value.clone(),
            },
        );
    }

    fn tool_part(&mut self, step_id: &str, content_index: usize) -> Option<&mut ContentPart> {
        let index = *self.step_index.get(step_id)?;
        let next = self.next_slot.entry(step_id.to_string()).or_insert(0);
        *next = (*next).max(content_index.saturating_add(1));
        Some(
            self.parts
                .entry((index, content_index))
                .or_insert_with(|| ContentPart::ToolCall {
                    id: None,
                    name: None,
                    args: String::new(),
                    output: None,
                    is_error: false,
                }),
        )
    }

    fn apply_tool_end(&mut self, end: &ToolEndEvent) {
        let Some(part) = self.tool_part(&end.step_id, end.content_index) else {
            return;
        };
        let args = match &end.tool_call.args {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        *part = ContentPart::ToolCall {
            id: Some(end.tool_call.id.clone()),
            name: Some(end.tool_call.name.clone()),
            args,
            output: Some(end.output.clone()),
            is_error: end.is_error,
        };
    }

    fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::RunStepCreated { step } => {
                self.step_index.insert(step.id.clone(), step.index);
            }
            StreamEvent::MessageDelta { step_id, part } => match part {
                ContentPart::Text { text } => self.append_text(step_id, text, false),
                ContentPart::Reasoning { text } => self.append_text(step_id, text, true),
                ContentPart::Artifact { value } => self.push_artifact(step_id, value),
                ContentPart::ToolCall { .. } => {}
            },
            StreamEvent::ReasoningDelta { step_id, text } => self.append_text(step_id, text, true),
            StreamEvent::ToolCallChunk {
                step_id,
                content_index,
                chunk,
            } => {
                if let Some(ContentPart::ToolCall { id, name, args, .. }) =
                    self.tool_part(step_id, *content_index)
                {
                    if id.is_none() {
                        *id = chunk.id.clone();
                    }
                    if name.is_none() {
                        *name = chunk.name.clone();
                    }
                    args.push_str(&chunk.args_fragment);
                }
            }
            StreamEvent::ToolEnd(end) => self.apply_tool_end(end),
            StreamEvent::RunEnd { outcome, .. } => self.outcome = Some(outcome.clone()),
            StreamEvent::RunStepClosed { .. }
            | StreamEvent::Usage { .. }
            | StreamEvent::ModelEnd { .. } => {}
        }
    }
}

/// Folds content deltas and tool results into the final ordered content.
#[derive(Clone, Default)]
pub struct ContentAggregator {
    state: Arc<Mutex<ContentState>>,
}

impl ContentAggregator {
    /// Event kinds the aggregator consumes.
    pub const EVENTS: [EventKind; 6] = [
        EventKind::RunStepCreated,
        EventKind::MessageDelta,
        EventKind::ReasoningDelta,
        EventKind::ToolCallChunk,
        EventKind::ToolEnd,
        EventKind::RunEnd,
    ];

    /// Empty aggregator; attach it before the run starts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers this aggregator for the tags it folds.
    pub fn attach(&self, dispatcher: &mut EventDispatcher) {
        dispatcher.register_many(&Self::EVENTS, Arc::new(self.clone()));
    }

    /// Folds a finalized event log from scratch.
    pub fn fold(events: &[StreamEvent]) -> Result<Vec<ContentPart>, AggregateError> {
        let aggregator = Self::new();
        for event in events {
            aggregator.handle(event);
        }
        aggregator.get_result()
    }

    /// Final content ordered by `(step index, content index)`; only available
    /// after `RUN_END`.
    pub fn get_result(&self) -> Result<Vec<ContentPart>, AggregateError> {
        let state = lock(&self.state);
        outcome_result(&state.outcome, || state.parts.values().cloned().collect())
    }
}

impl EventHandler for ContentAggregator {
    fn handle(&self, event: &StreamEvent) {
        lock(&self.state).apply(event);
    }
}

/// How a provider reports usage across fragments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageMode {
    /// Each fragment is a running total; the latest replaces the sum.
    Cumulative,
    /// Each fragment is a delta; fragments are summed.
    Incremental,
}

#[derive(Default)]
struct MetadataState {
    usage: Option<UsageMetadata>,
    fragments: usize,
    outcome: Option<RunOutcome>,
}

/// Folds `USAGE` fragments according to the provider's usage mode.
#[derive(Clone)]
pub struct MetadataAggregator {
    mode: UsageMode,
    state: Arc<Mutex<MetadataState>>,
}

impl MetadataAggregator {
    /// Usage aggregator folding fragments per `mode`.
    pub fn new(mode: UsageMode) -> Self {
        Self {
            mode,
            state: Arc::new(Mutex::new(MetadataState::default())),
        }
    }

    /// How usage fragments are combined.
    pub fn mode(&self) -> UsageMode {
        self.mode
    }

    /// Registers for usage and run-end events.
    pub fn attach(&self, dispatcher: &mut EventDispatcher) {
        dispatcher.register_many(&[EventKind::Usage, EventKind::RunEnd], Arc::new(self.clone()));
    }

    /// Number of usage fragments folded so far.
    pub fn fragments(&self) -> usize {
        lock(&self.state).fragments
    }

    /// Total usage; zero counters when the run reported none.
    pub fn get_result(&self) -> Result<UsageMetadata, AggregateError> {
        let state = lock(&self.state);
        outcome_result(&state.outcome, || state.usage.unwrap_or_default())
    }
}

impl EventHandler for MetadataAggregator {
    fn handle(&self, event: &StreamEvent) {
        let mut state = lock(&self.state);
        match event {
            StreamEvent::Usage { usage, .. } => {
                state.fragments = state.fragments.saturating_add(1);
                state.usage = Some(match (self.mode, state.usage) {
                    (UsageMode::Cumulative, _) | (UsageMode::Incremental, None) => *usage,
                    (UsageMode::Incremental, Some(total)) => total.add(usage),
                });
            }
            StreamEvent::RunEnd { outcome, .. } => state.outcome = Some(outcome.clone()),
            _ => {}
        }
    }
}

//! Classification and batching of text and reasoning fragments into
//! step-scoped deltas.

use crate::config::{ReasoningKey, StreamConfig};
use crate::content::{ContentPart, MessageContent, RawChunk};
use crate::events::{StepType, StreamEvent};
use crate::steps::{RunSteps, step_key};

const CODE_FENCE: &str = "```";
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Scanned in this order; the earliest match in a fragment wins.
const SEPARATORS: [&str; 3] = [CODE_FENCE, THINK_OPEN, THINK_CLOSE];

/// Stateful splitter for one run.
///
/// Text is scanned for code fences and think tags. Think tags switch the step
/// between TEXT and REASONING; code fences only force a batch boundary, and
/// think tags inside a fence are literal text.
#[derive(Debug)]
pub struct StreamSplitter {
    accumulate: bool,
    reasoning_key: ReasoningKey,
    block_threshold: usize,
    in_code_block: bool,
    in_think_block: bool,
    /// Unscanned text that may end in a partial separator.
    pending: String,
    buffer: String,
    current_length: usize,
    current_type: Option<StepType>,
    current_step: Option<String>,
}

impl StreamSplitter {
    /// Splitter with no open step; a zero threshold is treated as 1.
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            accumulate: config.accumulate,
            reasoning_key: config.reasoning_key,
            block_threshold: config.block_threshold.max(1),
            in_code_block: false,
            in_think_block: false,
            pending: String::new(),
            buffer: String::new(),
            current_length: 0,
            current_type: None,
            current_step: None,
        }
    }

    /// Inside a triple-backtick fence.
    pub fn in_code_block(&self) -> bool {
        self.in_code_block
    }

    /// Between `<think>` and `</think>`.
    pub fn in_think_block(&self) -> bool {
        self.in_think_block
    }

    /// Consumes one chunk: configured reasoning field first, then content.
    /// Non-text content parts are dispatched positionally as artifacts.
    pub fn handle(&mut self, steps: &mut RunSteps, chunk: &RawChunk, out: &mut Vec<StreamEvent>) {
        if let Some(reasoning) = self.reasoning_key.read(&chunk.additional_fields) {
            self.push_reasoning(steps, reasoning, out);
        }
        match &chunk.content {
            MessageContent::Text(text) => self.push_text(steps, text, out),
            MessageContent::Parts(parts) => {
                for part in parts {
                    match text_of_part(part) {
                        Some(text) => self.push_text(steps, text, out),
                        None => self.push_artifact(steps, part.clone(), out),
                    }
                }
            }
        }
    }

    /// Appends raw model text, honoring separators.
    pub fn push_text(&mut self, steps: &mut RunSteps, text: &str, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.pending.push_str(text);
        self.scan(steps, false, out);
    }

    /// Appends text that is reasoning regardless of markers.
    ///
    /// Pending text is resolved first, so a marker split around this call
    /// (`"<thi"`, reasoning, `"nk>"`) is emitted as literal text.
    pub fn push_reasoning(&mut self, steps: &mut RunSteps, text: &str, out: &mut Vec<StreamEvent>) {
        // Anything still pending precedes this fragment.
        self.scan(steps, true, out);
        self.push_fragment(steps, StepType::Reasoning, text, out);
    }

    /// Dispatches a structured part on the current text step.
    pub fn push_artifact(
        &mut self,
        steps: &mut RunSteps,
        value: serde_json::Value,
        out: &mut Vec<StreamEvent>,
    ) {
        self.scan(steps, true, out);
        self.ensure_step(steps, StepType::Text, out);
        self.flush(out);
        if let Some(step_id) = &self.current_step {
            out.push(StreamEvent::MessageDelta {
                step_id: step_id.clone(),
                part: ContentPart::Artifact { value },
            });
        }
    }

    /// Flushes everything and closes the current step, e.g. before a tool-call
    /// step opens. Block state is kept. A partial marker still pending is
    /// flushed as literal text.
    pub fn close_current(&mut self, steps: &mut RunSteps, out: &mut Vec<StreamEvent>) {
        self.scan(steps, true, out);
        self.flush(out);
        if let Some(step_id) = self.current_step.take() {
            steps.close_step(&step_id, out);
        }
        self.current_type = None;
    }

    /// End of a generation: flushes trailing content shorter than the
    /// threshold, closes the open step and resets block state.
    pub fn finish(&mut self, steps: &mut RunSteps, out: &mut Vec<StreamEvent>) {
        self.close_current(steps, out);
        self.in_code_block = false;
        self.in_think_block = false;
    }

    fn scan(&mut self, steps: &mut RunSteps, at_end: bool, out: &mut Vec<StreamEvent>) {
        loop {
            let separators: &[&str] = if self.in_code_block {
                &SEPARATORS[..1]
            } else {
                &SEPARATORS
            };
            match earliest_separator(&self.pending, separators) {
                Some((pos, separator)) => {
                    let before: String = self.pending.drain(..pos).collect();
                    self.pending.replace_range(..separator.len(), "");
                    self.push_classified(steps, &before, out);
                    self.apply_separator(steps, separator, out);
                }
                None => {
                    let keep = if at_end {
                        0
                    } else {
                        partial_separator_len(&self.pending, separators)
                    };
                    let cut = self.pending.len() - keep;
                    let ready: String = self.pending.drain(..cut).collect();
                    self.push_classified(steps, &ready, out);
                    return;
                }
            }
        }
    }

    fn apply_separator(
        &mut self,
        steps: &mut RunSteps,
        separator: &'static str,
        out: &mut Vec<StreamEvent>,
    ) {
        match separator {
            CODE_FENCE => {
                let step_type = self.classified_type();
                if self.in_code_block {
                    self.push_fragment(steps, step_type, CODE_FENCE, out);
                    self.flush(out);
                } else {
                    self.flush(out);
                    self.push_fragment(steps, step_type, CODE_FENCE, out);
                }
                self.in_code_block = !self.in_code_block;
            }
            THINK_OPEN if !self.in_think_block => self.in_think_block = true,
            THINK_CLOSE if self.in_think_block => self.in_think_block = false,
            // Unbalanced tags are ordinary text.
            literal => self.push_classified(steps, literal, out),
        }
    }

    fn classified_type(&self) -> StepType {
        if self.in_think_block {
            StepType::Reasoning
        } else {
            StepType::Text
        }
    }

    fn push_classified(&mut self, steps: &mut RunSteps, text: &str, out: &mut Vec<StreamEvent>) {
        let step_type = self.classified_type();
        self.push_fragment(steps, step_type, text, out);
    }

    fn push_fragment(
        &mut self,
        steps: &mut RunSteps,
        step_type: StepType,
        text: &str,
        out: &mut Vec<StreamEvent>,
    ) {
        if text.is_empty() {
            return;
        }
        self.ensure_step(steps, step_type, out);
        self.buffer.push_str(text);
        self.current_length += text.chars().count();
        if self.current_length >= self.block_threshold {
            self.flush(out);
        }
    }

    fn ensure_step(&mut self, steps: &mut RunSteps, step_type: StepType, out: &mut Vec<StreamEvent>) {
        if self.current_type == Some(step_type) && self.current_step.is_some() {
            return;
        }
        self.flush(out);
        if let Some(previous) = self.current_step.take() {
            steps.close_step(&previous, out);
        }
        let run_id = steps.run_id();
        let message_key = format!("{run_id}:message");
        let message_id = steps.message_id(&message_key, self.accumulate);
        let key = step_key(&run_id, &message_id, step_type);
        let step_id = steps.create_step(step_type, message_id, Some(&key), out);
        self.current_step = Some(step_id);
        self.current_type = Some(step_type);
    }

    fn flush(&mut self, out: &mut Vec<StreamEvent>) {
        if self.buffer.is_empty() {
            return;
        }
        let Some(step_id) = self.current_step.clone() else {
            return;
        };
        let text = std::mem::take(&mut self.buffer);
        self.current_length = 0;
        let event = match self.current_type {
            Some(StepType::Reasoning) => StreamEvent::ReasoningDelta { step_id, text },
            _ => StreamEvent::MessageDelta {
                step_id,
                part: ContentPart::Text { text },
            },
        };
        out.push(event);
    }
}

/// Text carried by a `{"type": "text", "text": ...}` content part.
fn text_of_part(part: &serde_json::Value) -> Option<&str> {
    match part.get("type").and_then(|v| v.as_str()) {
        Some("text") | None => part.get("text").and_then(|v| v.as_str()),
        _ => None,
    }
}

fn earliest_separator(text: &str, separators: &[&'static str]) -> Option<(usize, &'static str)> {
    separators
        .iter()
        .filter_map(|sep| text.find(sep).map(|pos| (pos, *sep)))
        .min_by_key(|(pos, _)| *pos)
}

/// Length of the longest suffix of `text` that is a proper prefix of a separator.
fn partial_separator_len(text: &str, separators: &[&str]) -> usize {
    let longest = separators.iter().map(|s| s.len()).max().unwrap_or(0);
    for len in (1..longest.min(text.len() + 1)).rev() {
        let start = text.len() - len;
        if !text.is_char_boundary(start) {
            continue;
        }
        let suffix = &text[start..];
        if separators
            .iter()
            .any(|sep| sep.len() > len && sep.starts_with(suffix))
        {
            return len;
        }
    }
    0
}

//! Tool-call fragment assembly and step correlation.

use crate::config::{ReasoningKey, StreamConfig};
use crate::content::{MessageContent, RawChunk, ToolCall, ToolCallChunk};
use crate::errors::StreamError;
use crate::events::{StepType, StreamEvent};
use crate::steps::{RunSteps, step_key};

/// A tool call whose fragments were completed by a terminal signal.
#[derive(Clone, Debug, PartialEq)]
pub struct AssembledToolCall {
    pub step_id: String,
    pub content_index: usize,
    pub call: ToolCall,
    /// Set when the accumulated arguments did not parse; `call.args` then
    /// holds the raw text as a JSON string.
    pub error: Option<StreamError>,
}

#[derive(Debug)]
struct ToolSlot {
    index: Option<u32>,
    id: Option<String>,
    name: Option<String>,
    args: String,
    content_index: usize,
}

/// Accumulates partial tool calls for one run and maps them to a tool-call
/// step.
///
/// Providers flagged for manual assembly buffer the whole call and emit one
/// complete `TOOL_CALL_CHUNK` per call at completion; the rest stream every
/// fragment as it arrives.
#[derive(Debug)]
pub struct ChunkCorrelator {
    reasoning_key: ReasoningKey,
    manual_assembly: bool,
    slots: Vec<ToolSlot>,
    tool_step: Option<String>,
    provider_message_id: Option<String>,
}

impl ChunkCorrelator {
    /// Correlator for one run. `manual_assembly` buffers fragments until completion.
    pub fn new(config: &StreamConfig, manual_assembly: bool) -> Self {
        Self {
            reasoning_key: config.reasoning_key,
            manual_assembly,
            slots: Vec::new(),
            tool_step: None,
            provider_message_id: None,
        }
    }

    /// Whether calls are assembled only at the end of a generation.
    pub fn manual_assembly(&self) -> bool {
        self.manual_assembly
    }

    /// Number of tool calls currently being accumulated.
    pub fn pending_calls(&self) -> usize {
        self.slots.len()
    }

    /// Moves reasoning embedded in content parts (`thinking`, `reasoning`,
    /// `reasoning_content` part types) into the configured reasoning field so
    /// the splitter sees it as a reasoning fragment.
    pub fn extract_reasoning(&self, mut chunk: RawChunk) -> RawChunk {
        let mut extracted = String::new();
        if let MessageContent::Parts(parts) = &mut chunk.content {
            parts.retain(|part| match reasoning_of_part(part) {
                Some(text) => {
                    extracted.push_str(&text);
                    false
                }
                None => true,
            });
        }
        if extracted.is_empty() {
            return chunk;
        }
        let field = match self.reasoning_key {
            ReasoningKey::Reasoning => &mut chunk.additional_fields.reasoning,
            ReasoningKey::ReasoningContent => &mut chunk.additional_fields.reasoning_content,
        };
        field.get_or_insert_with(String::new).push_str(&extracted);
        chunk
    }

    /// Folds the chunk's tool-call fragments into their slots.
    pub fn handle(&mut self, steps: &mut RunSteps, chunk: &RawChunk, out: &mut Vec<StreamEvent>) {
        if chunk.tool_call_chunks.is_empty() {
            return;
        }
        if self.provider_message_id.is_none() {
            self.provider_message_id = chunk.id.clone();
        }
        for fragment in &chunk.tool_call_chunks {
            let content_index = self.accumulate(fragment);
            if !self.manual_assembly {
                let step_id = self.ensure_tool_step(steps, out);
                out.push(StreamEvent::ToolCallChunk {
                    step_id,
                    content_index,
                    chunk: fragment.clone(),
                });
            }
        }
    }

    /// Terminal signal: parses every accumulated call, closes the tool step
    /// and resets for the next generation.
    pub fn complete(
        &mut self,
        steps: &mut RunSteps,
        out: &mut Vec<StreamEvent>,
    ) -> Vec<AssembledToolCall> {
        if self.slots.is_empty() {
            return Vec::new();
        }
        let step_id = self.ensure_tool_step(steps, out);
        let slots = std::mem::take(&mut self.slots);
        let mut assembled = Vec::with_capacity(slots.len());
        for slot in slots {
            let id = slot
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            let name = slot.name.unwrap_or_default();
            if self.manual_assembly {
                out.push(StreamEvent::ToolCallChunk {
                    step_id: step_id.clone(),
                    content_index: slot.content_index,
                    chunk: ToolCallChunk {
                        index: slot.index,
                        id: Some(id.clone()),
                        name: Some(name.clone()),
                        args_fragment: slot.args.clone(),
                    },
                });
            }
            let (args, error) = match parse_args(&slot.args) {
                Ok(args) => (args, None),
                Err(e) => (
                    serde_json::Value::String(slot.args.clone()),
                    Some(StreamError::MalformedToolArgs {
                        call_id: id.clone(),
                        name: name.clone(),
                        message: e.to_string(),
                    }),
                ),
            };
            assembled.push(AssembledToolCall {
                step_id: step_id.clone(),
                content_index: slot.content_index,
                call: ToolCall { id, name, args },
                error,
            });
        }
        steps.close_step(&step_id, out);
        self.tool_step = None;
        self.provider_message_id = None;
        assembled
    }

    /// Returns the slot position the fragment was folded into.
    fn accumulate(&mut self, fragment: &ToolCallChunk) -> usize {
        let existing = match (fragment.index, fragment.id.as_deref()) {
            (Some(index), _) => self.slots.iter().position(|s| s.index == Some(index)),
            (None, Some(id)) => self.slots.iter().position(|s| s.id.as_deref() == Some(id)),
            // No identity at all continues the most recent call.
            (None, None) => self.slots.len().checked_sub(1),
        };
        let position = match existing {
            Some(position) => position,
            None => {
                let content_index = self.slots.len();
                self.slots.push(ToolSlot {
                    index: fragment.index,
                    id: None,
                    name: None,
                    args: String::new(),
                    content_index,
                });
                content_index
            }
        };
        let slot = &mut self.slots[position];
        if slot.id.is_none() {
            slot.id = fragment.id.clone().filter(|id| !id.is_empty());
        }
        if slot.name.is_none() {
            slot.name = fragment.name.clone().filter(|name| !name.is_empty());
        }
        slot.args.push_str(&fragment.args_fragment);
        slot.content_index
    }

    fn ensure_tool_step(&mut self, steps: &mut RunSteps, out: &mut Vec<StreamEvent>) -> String {
        if let Some(step_id) = &self.tool_step {
            return step_id.clone();
        }
        let run_id = steps.run_id();
        let message_id = match &self.provider_message_id {
            Some(id) => id.clone(),
            None => steps.message_id(&format!("{run_id}:message"), true),
        };
        let key = step_key(&run_id, &message_id, StepType::ToolCall);
        let step_id = match steps.step_id(&key) {
            Some(existing) if steps.is_open(existing) => existing.to_string(),
            _ => steps.create_step(StepType::ToolCall, message_id, Some(&key), out),
        };
        self.tool_step = Some(step_id.clone());
        step_id
    }
}

fn parse_args(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw)
}

fn reasoning_of_part(part: &serde_json::Value) -> Option<String> {
    let text = match part.get("type").and_then(|v| v.as_str())? {
        "thinking" => part.get("thinking").and_then(|v| v.as_str()),
        "reasoning" => part
            .get("reasoning")
            .or_else(|| part.get("text"))
            .and_then(|v| v.as_str()),
        "reasoning_content" => part
            .get("reasoning_content")
            .and_then(|v| v.get("text").or(Some(v)))
            .and_then(|v| v.as_str()),
        _ => None,
    }?;
    Some(text.to_string())
}

//! Per-run step ledger shared by the splitter and the correlator.
//!
//! The ledger is a plain value owned by the run's processor and lent out
//! mutably for the duration of one chunk; there is no interior mutability.

use std::collections::HashMap;

use tracing::debug;

use crate::events::{RunStep, StepType, StreamEvent};

/// Builds the provider-independent step key for a message and step kind.
pub fn step_key(run_id: &uuid::Uuid, message_id: &str, step_type: StepType) -> String {
    format!("{run_id}:{message_id}:{}", step_type.as_str())
}

pub(crate) fn new_step_id() -> String {
    format!("step_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug)]
struct StepRecord {
    step: RunStep,
    open: bool,
}

/// Step bookkeeping for one run: index counter, step-key lookups, open state.
#[derive(Debug)]
pub struct RunSteps {
    run_id: uuid::Uuid,
    next_index: u32,
    steps: HashMap<String, StepRecord>,
    step_ids: HashMap<String, String>,
    message_ids: HashMap<String, String>,
}

impl RunSteps {
    /// Empty ledger for `run_id`.
    pub fn new(run_id: uuid::Uuid) -> Self {
        Self {
            run_id,
            next_index: 0,
            steps: HashMap::new(),
            step_ids: HashMap::new(),
            message_ids: HashMap::new(),
        }
    }

    /// Run the ledger belongs to.
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Returns the message id for `step_key`, creating one on first sight or
    /// when `reuse_existing` is false.
    pub fn message_id(&mut self, step_key: &str, reuse_existing: bool) -> String {
        if reuse_existing && let Some(existing) = self.message_ids.get(step_key) {
            return existing.clone();
        }
        let id = new_message_id();
        self.message_ids.insert(step_key.to_string(), id.clone());
        id
    }

    /// Step id previously registered under `step_key`.
    pub fn step_id(&self, step_key: &str) -> Option<&str> {
        self.step_ids.get(step_key).map(String::as_str)
    }

    /// Step by id, open or closed.
    pub fn get(&self, step_id: &str) -> Option<&RunStep> {
        self.steps.get(step_id).map(|record| &record.step)
    }

    /// True while the step accepts deltas.
    pub fn is_open(&self, step_id: &str) -> bool {
        self.steps.get(step_id).is_some_and(|record| record.open)
    }

    /// Number of steps created so far (open or closed).
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True before the first step is created.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Creates a step, registers it under `step_key` when given, and queues
    /// its creation event.
    pub fn create_step(
        &mut self,
        step_type: StepType,
        message_id: String,
        step_key: Option<&str>,
        out: &mut Vec<StreamEvent>,
    ) -> String {
        self.insert_step(new_step_id(), step_type, message_id, step_key, out)
    }

    /// Registers a step whose id was minted elsewhere and closes it at once.
    ///
    /// Used for tool results whose originating step was never streamed.
    pub fn adopt_closed_step(
        &mut self,
        step_id: &str,
        step_type: StepType,
        out: &mut Vec<StreamEvent>,
    ) {
        if self.steps.contains_key(step_id) {
            return;
        }
        let message_id = new_message_id();
        let id = self.insert_step(step_id.to_string(), step_type, message_id, None, out);
        self.close_step(&id, out);
    }

    /// Registers a step announced by a replayed creation event. Returns false
    /// when the id is already known or the step belongs to another run.
    pub fn restore(&mut self, step: &RunStep) -> bool {
        if step.run_id != self.run_id || self.steps.contains_key(&step.id) {
            return false;
        }
        self.next_index = self.next_index.max(step.index.saturating_add(1));
        self.steps.insert(
            step.id.clone(),
            StepRecord {
                step: step.clone(),
                open: true,
            },
        );
        true
    }

    /// Closes an open step and queues its close event. Returns false when the
    /// step is unknown or already closed.
    pub fn close_step(&mut self, step_id: &str, out: &mut Vec<StreamEvent>) -> bool {
        let Some(record) = self.steps.get_mut(step_id) else {
            return false;
        };
        if !record.open {
            return false;
        }
        record.open = false;
        debug!(run_id = %self.run_id, step_id, "run step closed");
        out.push(StreamEvent::RunStepClosed {
            run_id: self.run_id,
            step_id: step_id.to_string(),
        });
        true
    }

    /// Ids of all open steps, in creation order.
    pub fn open_step_ids(&self) -> Vec<String> {
        let mut open: Vec<&RunStep> = self
            .steps
            .values()
            .filter(|record| record.open)
            .map(|record| &record.step)
            .collect();
        open.sort_by_key(|step| step.index);
        open.into_iter().map(|step| step.id.clone()).collect()
    }

    fn insert_step(
        &mut self,
        id: String,
        step_type: StepType,
        message_id: String,
        step_key: Option<&str>,
        out: &mut Vec<StreamEvent>,
    ) -> String {
        let step = RunStep {
            id: id.clone(),
            run_id: self.run_id,
            step_type,
            message_id,
            index: self.next_index,
        };
        self.next_index = self.next_index.saturating_add(1);
        if let Some(key) = step_key {
            self.step_ids.insert(key.to_string(), id.clone());
        }
        debug!(run_id = %self.run_id, step_id = %id, step_type = step_type.as_str(), index = step.index, "run step created");
        out.push(StreamEvent::RunStepCreated { step: step.clone() });
        self.steps.insert(id.clone(), StepRecord { step, open: true });
        id
    }
}

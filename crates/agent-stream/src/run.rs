use std::collections::HashMap;
use std::sync::Arc;

use futures::{Stream, StreamExt as _};
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::content::{MessageContent, RawChunk, ToolCall};
use crate::correlator::{AssembledToolCall, ChunkCorrelator};
use crate::dispatch::EventDispatcher;
use crate::errors::{RunFailure, StreamError};
use crate::events::{RunOutcome, StepType, StreamEvent, ToolEndEvent};
use crate::provider::ProviderProfile;
use crate::runnable::RunnableConfig;
use crate::splitter::StreamSplitter;
use crate::steps::RunSteps;
use crate::tools::{ToolCallStep, ToolDispatchNode};

/// What a finished turn produced besides its events.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub run_id: uuid::Uuid,
    /// Well-formed tool calls requested by the model.
    pub tool_calls: Vec<ToolCall>,
    pub tool_ends: Vec<ToolEndEvent>,
    /// Recoverable errors recorded during the run.
    pub diagnostics: Vec<StreamError>,
    pub steps: usize,
}

/// Single consumer of one run's chunk sequence.
///
/// Owns every piece of per-run state (step ledger, splitter, correlator) and
/// dispatches events synchronously as each chunk is handled. Dropping the
/// processor abandons the run; buffered content is discarded.
pub struct RunProcessor {
    run_id: uuid::Uuid,
    dispatcher: Arc<EventDispatcher>,
    runnable_config: RunnableConfig,
    steps: RunSteps,
    splitter: StreamSplitter,
    correlator: ChunkCorrelator,
    ready_calls: Vec<ToolCall>,
    tool_steps: HashMap<String, ToolCallStep>,
    diagnostics: Vec<StreamError>,
    generation_ended: bool,
    ended: bool,
}

impl RunProcessor {
    /// Processor for a fresh run id.
    pub fn new(
        config: &StreamConfig,
        profile: &ProviderProfile,
        dispatcher: impl Into<Arc<EventDispatcher>>,
    ) -> Result<Self, StreamError> {
        Self::with_run_id(uuid::Uuid::new_v4(), config, profile, dispatcher)
    }

    /// Processor for a known run id, e.g. when replaying a recorded log.
    pub fn with_run_id(
        run_id: uuid::Uuid,
        config: &StreamConfig,
        profile: &ProviderProfile,
        dispatcher: impl Into<Arc<EventDispatcher>>,
    ) -> Result<Self, StreamError> {
        if !profile.capabilities.streaming {
            return Err(StreamError::Config(format!(
                "provider {} does not support streaming",
                profile.name
            )));
        }
        let config = profile.stream_config(config);
        config.validate()?;
        Ok(Self {
            run_id,
            dispatcher: dispatcher.into(),
            runnable_config: RunnableConfig::for_run(run_id),
            steps: RunSteps::new(run_id),
            splitter: StreamSplitter::new(&config),
            correlator: ChunkCorrelator::new(&config, profile.manual_tool_stream),
            ready_calls: Vec::new(),
            tool_steps: HashMap::new(),
            diagnostics: Vec::new(),
            generation_ended: false,
            ended: false,
        })
    }

    /// Config forwarded to tools; its run id is forced to this run's.
    pub fn runnable_config(mut self, config: RunnableConfig) -> Self {
        self.runnable_config = RunnableConfig {
            run_id: Some(self.run_id),
            ..config
        };
        self
    }

    /// Id shared by every event of this run.
    pub fn run_id(&self) -> uuid::Uuid {
        self.run_id
    }

    /// Step ledger, read-only.
    pub fn steps(&self) -> &RunSteps {
        &self.steps
    }

    /// Recoverable errors seen so far.
    pub fn diagnostics(&self) -> &[StreamError] {
        &self.diagnostics
    }

    /// True once `RUN_END` was dispatched.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Handles one raw chunk: content first, then tool-call fragments, usage,
    /// and finally the finish signal.
    pub fn handle_chunk(&mut self, chunk: RawChunk) {
        if self.ended {
            warn!(run_id = %self.run_id, "chunk after run end dropped");
            return;
        }
        let chunk = self.correlator.extract_reasoning(chunk);
        if carries_output(&chunk) {
            self.generation_ended = false;
        }
        let mut out = Vec::new();
        self.splitter.handle(&mut self.steps, &chunk, &mut out);
        if !chunk.tool_call_chunks.is_empty() {
            self.splitter.close_current(&mut self.steps, &mut out);
            self.correlator.handle(&mut self.steps, &chunk, &mut out);
        }
        if let Some(usage) = chunk.usage_metadata {
            out.push(StreamEvent::Usage {
                run_id: self.run_id,
                usage,
            });
        }
        self.emit(out);
        if let Some(reason) = chunk.finish_reason {
            self.finish_model(Some(reason));
        }
    }

    /// Ends the current model generation: flushes and closes every step,
    /// completes pending tool calls and dispatches `MODEL_END`. A second call
    /// without new chunks in between does nothing.
    pub fn finish_model(&mut self, finish_reason: Option<String>) {
        if self.ended || self.generation_ended {
            return;
        }
        self.generation_ended = true;
        let mut out = Vec::new();
        self.splitter.finish(&mut self.steps, &mut out);
        let assembled = self.correlator.complete(&mut self.steps, &mut out);
        self.emit(out);
        for call in assembled {
            self.accept_tool_call(call);
        }
        debug!(run_id = %self.run_id, finish_reason = ?finish_reason, steps = self.steps.len(), "model generation finished");
        self.dispatch(StreamEvent::ModelEnd {
            run_id: self.run_id,
            finish_reason,
        });
    }

    /// Takes the calls ready for execution and their step locations.
    pub fn take_tool_calls(&mut self) -> (Vec<ToolCall>, HashMap<String, ToolCallStep>) {
        (
            std::mem::take(&mut self.ready_calls),
            std::mem::take(&mut self.tool_steps),
        )
    }

    /// Dispatches a tool result, first creating and closing a tool-call step
    /// for it when the step was never seen by this run.
    pub fn tool_end(&mut self, event: ToolEndEvent) {
        if self.ended {
            warn!(run_id = %self.run_id, call_id = %event.tool_call.id, "tool end after run end dropped");
            return;
        }
        if self.steps.get(&event.step_id).is_none() {
            let mut out = Vec::new();
            self.steps
                .adopt_closed_step(&event.step_id, StepType::ToolCall, &mut out);
            self.emit(out);
        }
        self.dispatch(StreamEvent::ToolEnd(event));
    }

    /// Dispatches the terminal event. Completion flushes the open generation;
    /// failure discards buffered content and only closes open steps.
    pub fn end_run(&mut self, outcome: RunOutcome) {
        if self.ended {
            return;
        }
        match &outcome {
            RunOutcome::Completed => self.finish_model(None),
            RunOutcome::Failed(failure) => {
                warn!(run_id = %self.run_id, error = %failure, "run failed");
                let mut out = Vec::new();
                for step_id in self.steps.open_step_ids() {
                    self.steps.close_step(&step_id, &mut out);
                }
                self.emit(out);
            }
        }
        self.ended = true;
        self.dispatcher.dispatch(&StreamEvent::RunEnd {
            run_id: self.run_id,
            outcome,
        });
    }

    /// Validates and dispatches an externally supplied event, e.g. when
    /// replaying a recorded log. Events that would break step ordering are
    /// dropped and recorded as `StreamDesync` diagnostics.
    pub fn apply(&mut self, event: StreamEvent) {
        if self.ended {
            self.desync(&event);
            return;
        }
        match event {
            StreamEvent::RunStepCreated { step } => {
                if self.steps.restore(&step) {
                    self.dispatch(StreamEvent::RunStepCreated { step });
                } else {
                    self.desync(&StreamEvent::RunStepCreated { step });
                }
            }
            StreamEvent::RunStepClosed { step_id, .. } => {
                let mut out = Vec::new();
                if self.steps.close_step(&step_id, &mut out) {
                    self.emit(out);
                } else {
                    self.desync(&StreamEvent::RunStepClosed {
                        run_id: self.run_id,
                        step_id,
                    });
                }
            }
            StreamEvent::ToolEnd(end) => self.tool_end(end),
            StreamEvent::RunEnd { outcome, .. } => self.end_run(outcome),
            StreamEvent::ModelEnd { run_id, finish_reason } => {
                self.generation_ended = true;
                self.dispatch(StreamEvent::ModelEnd {
                    run_id,
                    finish_reason,
                });
            }
            event if event.is_delta() => {
                let open = event.step_id().is_some_and(|id| self.steps.is_open(id));
                if open {
                    self.dispatch(event);
                } else {
                    self.desync(&event);
                }
            }
            event => self.dispatch(event),
        }
    }

    /// Consumes a chunk stream to the end, runs requested tools through
    /// `tools` (when given) and dispatches the terminal event.
    ///
    /// Producer errors and unhandled tool errors end the run as failed and
    /// are returned unchanged.
    pub async fn run<S, E>(
        mut self,
        stream: S,
        tools: Option<&ToolDispatchNode>,
    ) -> Result<RunSummary, StreamError>
    where
        S: Stream<Item = Result<RawChunk, E>>,
        E: Into<StreamError>,
    {
        let mut stream = std::pin::pin!(stream);
        while let Some(next) = stream.next().await {
            match next {
                Ok(chunk) => self.handle_chunk(chunk),
                Err(err) => return Err(self.fail(err.into())),
            }
        }
        self.finish_model(None);

        let (tool_calls, step_ids) = self.take_tool_calls();
        let mut tool_ends = Vec::new();
        if let Some(node) = tools
            && !tool_calls.is_empty()
        {
            let results = node
                .dispatch_with_steps(tool_calls.clone(), &step_ids, &self.runnable_config)
                .await;
            match results {
                Ok(ends) => {
                    for end in ends {
                        self.tool_end(end.clone());
                        tool_ends.push(end);
                    }
                }
                Err(err) => return Err(self.fail(err)),
            }
        }

        self.end_run(RunOutcome::Completed);
        Ok(RunSummary {
            run_id: self.run_id,
            tool_calls,
            tool_ends,
            diagnostics: self.diagnostics,
            steps: self.steps.len(),
        })
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        self.end_run(RunOutcome::Failed(RunFailure::from(&err)));
        err
    }

    fn accept_tool_call(&mut self, assembled: AssembledToolCall) {
        let AssembledToolCall {
            step_id,
            content_index,
            call,
            error,
        } = assembled;
        match error {
            None => {
                self.tool_steps.insert(
                    call.id.clone(),
                    ToolCallStep {
                        step_id,
                        content_index,
                    },
                );
                self.ready_calls.push(call);
            }
            Some(err) => {
                warn!(run_id = %self.run_id, call_id = %call.id, error = %err, "tool call not executed");
                let output = format!("Error: {err}");
                self.diagnostics.push(err);
                self.dispatch(StreamEvent::ToolEnd(ToolEndEvent {
                    step_id,
                    tool_call: call,
                    content_index,
                    output,
                    is_error: true,
                }));
            }
        }
    }

    fn desync(&mut self, event: &StreamEvent) {
        let err = StreamError::StreamDesync {
            step_id: event.step_id().unwrap_or_default().to_string(),
            kind: event.kind().to_string(),
        };
        warn!(run_id = %self.run_id, error = %err, "event dropped");
        self.diagnostics.push(err);
    }

    fn emit(&self, events: Vec<StreamEvent>) {
        for event in &events {
            self.dispatcher.dispatch(event);
        }
    }

    fn dispatch(&self, event: StreamEvent) {
        self.dispatcher.dispatch(&event);
    }
}

/// Usage-only and finish-only chunks do not reopen a finished generation.
fn carries_output(chunk: &RawChunk) -> bool {
    let has_content = match &chunk.content {
        MessageContent::Text(text) => !text.is_empty(),
        MessageContent::Parts(parts) => !parts.is_empty(),
    };
    let fields = &chunk.additional_fields;
    has_content
        || !chunk.tool_call_chunks.is_empty()
        || fields.reasoning.as_deref().is_some_and(|t| !t.is_empty())
        || fields
            .reasoning_content
            .as_deref()
            .is_some_and(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::aggregate::{ContentAggregator, MetadataAggregator, UsageMode};
    use crate::content::{ContentPart, ToolCallChunk, UsageMetadata, joined_text};
    use crate::dispatch::EventLog;
    use crate::errors::AggregateError;
    use crate::events::EventKind;
    use crate::provider::ProviderKind;
    use crate::runnable::RunnableConfig;
    use crate::tools::{Tool, ToolError};

    struct Failing;

    #[async_trait::async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "lookup"
        }

        async fn call(
            &self,
            _args: serde_json::Value,
            _config: &RunnableConfig,
        ) -> Result<String, ToolError> {
            Err(ToolError::new("service unavailable"))
        }
    }

    struct Weather;

    #[async_trait::async_trait]
    impl Tool for Weather {
        fn name(&self) -> &str {
            "weather"
        }

        async fn call(
            &self,
            args: serde_json::Value,
            config: &RunnableConfig,
        ) -> Result<String, ToolError> {
            assert!(config.run_id.is_some());
            let city = args["city"].as_str().unwrap_or("nowhere");
            Ok(format!("sunny in {city}"))
        }
    }

    struct Harness {
        log: EventLog,
        content: ContentAggregator,
        usage: MetadataAggregator,
        dispatcher: EventDispatcher,
    }

    fn harness(mode: UsageMode) -> Harness {
        let log = EventLog::new();
        let content = ContentAggregator::new();
        let usage = MetadataAggregator::new(mode);
        let mut dispatcher = EventDispatcher::new();
        log.attach(&mut dispatcher);
        content.attach(&mut dispatcher);
        usage.attach(&mut dispatcher);
        Harness {
            log,
            content,
            usage,
            dispatcher,
        }
    }

    fn processor(h: &Harness, kind: ProviderKind, config: StreamConfig) -> RunProcessor {
        RunProcessor::new(&config, &ProviderProfile::for_kind(kind), h.dispatcher.clone())
            .expect("processor")
    }

    fn chunks(items: Vec<RawChunk>) -> impl Stream<Item = Result<RawChunk, StreamError>> {
        futures::stream::iter(items.into_iter().map(Ok))
    }

    fn assert_step_ordering(events: &[StreamEvent]) {
        let mut created = HashSet::new();
        let mut closed = HashSet::new();
        for event in events {
            match event {
                StreamEvent::RunStepCreated { step } => {
                    assert!(created.insert(step.id.clone()), "step created twice");
                }
                StreamEvent::RunStepClosed { step_id, .. } => {
                    assert!(created.contains(step_id), "close before create");
                    assert!(closed.insert(step_id.clone()), "step closed twice");
                }
                event if event.is_delta() => {
                    let id = event.step_id().unwrap_or_default();
                    assert!(created.contains(id), "delta before create");
                    assert!(!closed.contains(id), "delta after close");
                }
                StreamEvent::RunEnd { .. } => {
                    assert_eq!(created, closed, "run ended with open steps");
                }
                _ => {}
            }
        }
        let terminal = events
            .iter()
            .filter(|e| e.kind() == EventKind::RunEnd)
            .count();
        assert_eq!(terminal, 1);
        assert_eq!(events.last().map(StreamEvent::kind), Some(EventKind::RunEnd));
    }

    #[tokio::test]
    async fn text_and_reasoning_flow_into_aggregated_content() {
        let h = harness(UsageMode::Cumulative);
        let run = processor(&h, ProviderKind::OpenAi, StreamConfig::default().block_threshold(4));
        let summary = run
            .run(
                chunks(vec![
                    RawChunk::text("<think>plan"),
                    RawChunk::text(" it</think>Hel"),
                    RawChunk::text("lo").with_usage(UsageMetadata::new(3, 4)),
                    RawChunk::default().with_finish_reason("stop"),
                ]),
                None,
            )
            .await
            .expect("run");

        let events = h.log.events();
        assert_step_ordering(&events);
        assert_eq!(summary.steps, 2);
        assert!(summary.diagnostics.is_empty());

        let parts = h.content.get_result().expect("complete");
        assert_eq!(
            parts,
            vec![
                ContentPart::Reasoning {
                    text: "plan it".into()
                },
                ContentPart::text("Hello"),
            ]
        );
        assert_eq!(h.usage.get_result().expect("usage").total_tokens, 7);
        let model_end = events
            .iter()
            .position(|e| e.kind() == EventKind::ModelEnd)
            .expect("model end");
        assert!(matches!(
            &events[model_end],
            StreamEvent::ModelEnd { finish_reason: Some(reason), .. } if reason == "stop"
        ));
    }

    #[tokio::test]
    async fn tool_calls_execute_and_land_on_their_step() {
        let h = harness(UsageMode::Cumulative);
        let run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        let node = ToolDispatchNode::new(vec![Arc::new(Weather)]);
        let summary = run
            .run(
                chunks(vec![
                    RawChunk::text("Checking."),
                    RawChunk::tool_calls(vec![
                        ToolCallChunk::new(0, "{\"ci").with_id("call_1").with_name("weather"),
                    ]),
                    RawChunk::tool_calls(vec![ToolCallChunk::new(0, "ty\":\"Oslo\"}")])
                        .with_finish_reason("tool_calls"),
                ]),
                Some(&node),
            )
            .await
            .expect("run");

        assert_step_ordering(&h.log.events());
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(summary.tool_calls[0].args, serde_json::json!({"city": "Oslo"}));
        let end = &summary.tool_ends[0];
        let tool_step = h
            .log
            .events()
            .iter()
            .find_map(|e| match e {
                StreamEvent::RunStepCreated { step } if step.step_type == StepType::ToolCall => {
                    Some(step.id.clone())
                }
                _ => None,
            })
            .expect("tool step");
        assert_eq!(end.step_id, tool_step);
        assert_eq!(end.output, "sunny in Oslo");

        let parts = h.content.get_result().expect("complete");
        assert_eq!(joined_text(&parts), "Checking.");
        assert!(matches!(
            &parts[1],
            ContentPart::ToolCall { output: Some(out), is_error: false, .. } if out == "sunny in Oslo"
        ));
    }

    #[tokio::test]
    async fn thrown_tool_is_reported_and_run_still_ends() {
        let h = harness(UsageMode::Cumulative);
        let run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        let node = ToolDispatchNode::new(vec![Arc::new(Failing)]).handle_tool_errors(true);
        let summary = run
            .run(
                chunks(vec![RawChunk::tool_calls(vec![
                    ToolCallChunk::new(0, "{}").with_id("call_9").with_name("lookup"),
                ])]),
                Some(&node),
            )
            .await
            .expect("handled tool errors keep the run alive");

        assert!(summary.tool_ends[0].is_error);
        assert!(summary.tool_ends[0].output.contains("service unavailable"));
        let events = h.log.events();
        assert_step_ordering(&events);
        assert!(matches!(
            events.last(),
            Some(StreamEvent::RunEnd { outcome: RunOutcome::Completed, .. })
        ));
    }

    #[tokio::test]
    async fn unhandled_tool_error_fails_the_run() {
        let h = harness(UsageMode::Cumulative);
        let run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        let node = ToolDispatchNode::new(vec![Arc::new(Failing)]).handle_tool_errors(false);
        let err = run
            .run(
                chunks(vec![RawChunk::tool_calls(vec![
                    ToolCallChunk::new(0, "{}").with_id("call_9").with_name("lookup"),
                ])]),
                Some(&node),
            )
            .await
            .expect_err("tool error propagates");
        assert!(matches!(err, StreamError::ToolExecution { .. }));
        assert_step_ordering(&h.log.events());
        assert!(matches!(
            h.content.get_result(),
            Err(AggregateError::Failed(RunFailure::Tool { .. }))
        ));
    }

    #[tokio::test]
    async fn producer_error_discards_buffered_content() {
        let h = harness(UsageMode::Cumulative);
        let run = processor(&h, ProviderKind::OpenAi, StreamConfig::default().block_threshold(64));
        let stream = futures::stream::iter(vec![
            Ok(RawChunk::text("partial")),
            Err(StreamError::producer("connection reset")),
        ]);
        let err = run.run(stream, None).await.expect_err("producer failure");
        assert_eq!(err, StreamError::Producer("connection reset".into()));

        let events = h.log.events();
        assert_step_ordering(&events);
        assert!(!events.iter().any(|e| e.kind() == EventKind::MessageDelta));
        assert!(matches!(
            h.usage.get_result(),
            Err(AggregateError::Failed(RunFailure::Producer { .. }))
        ));
    }

    #[tokio::test]
    async fn malformed_args_become_error_tool_end_without_execution() {
        let h = harness(UsageMode::Incremental);
        let run = processor(&h, ProviderKind::Anthropic, StreamConfig::default());
        let node = ToolDispatchNode::new(vec![Arc::new(Weather)]);
        let summary = run
            .run(
                chunks(vec![
                    RawChunk::tool_calls(vec![
                        ToolCallChunk::new(0, "{\"city\":").with_id("call_1").with_name("weather"),
                    ])
                    .with_usage(UsageMetadata::new(10, 0)),
                    RawChunk::default().with_usage(UsageMetadata::new(0, 25)),
                ]),
                Some(&node),
            )
            .await
            .expect("run");

        assert!(summary.tool_calls.is_empty());
        assert!(summary.tool_ends.is_empty());
        assert!(matches!(
            summary.diagnostics.as_slice(),
            [StreamError::MalformedToolArgs { call_id, .. }] if call_id == "call_1"
        ));
        let events = h.log.events();
        assert_step_ordering(&events);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ToolEnd(end) if end.is_error && end.tool_call.id == "call_1"
        )));
        assert_eq!(h.usage.get_result().expect("usage").total_tokens, 35);
    }

    #[test]
    fn replay_drops_deltas_for_unknown_steps() {
        let h = harness(UsageMode::Cumulative);
        let mut run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        run.apply(StreamEvent::MessageDelta {
            step_id: "step_ghost".into(),
            part: ContentPart::text("boo"),
        });
        assert!(matches!(
            run.diagnostics(),
            [StreamError::StreamDesync { step_id, .. }] if step_id == "step_ghost"
        ));
        assert!(h.log.is_empty());
        assert!(!run.is_ended());
    }

    #[test]
    fn replaying_a_recorded_log_reproduces_the_content() {
        let source = harness(UsageMode::Cumulative);
        let mut original = processor(&source, ProviderKind::OpenAi, StreamConfig::default());
        original.handle_chunk(RawChunk::text("Replay me, "));
        original.handle_chunk(RawChunk::reasoning("thinking"));
        original.handle_chunk(RawChunk::text("done."));
        original.end_run(RunOutcome::Completed);
        let recorded = source.log.events();

        let target = harness(UsageMode::Cumulative);
        let mut replay = RunProcessor::with_run_id(
            original.run_id(),
            &StreamConfig::default(),
            &ProviderProfile::for_kind(ProviderKind::OpenAi),
            target.dispatcher.clone(),
        )
        .expect("processor");
        for event in recorded.iter().cloned() {
            replay.apply(event);
        }
        assert!(replay.diagnostics().is_empty());
        assert_eq!(target.log.events(), recorded);
        assert_eq!(
            target.content.get_result().expect("complete"),
            source.content.get_result().expect("complete")
        );
    }

    #[test]
    fn tool_end_for_unseen_step_adopts_it_first() {
        let h = harness(UsageMode::Cumulative);
        let mut run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        run.tool_end(ToolEndEvent {
            step_id: "step_fallback".into(),
            tool_call: ToolCall {
                id: "call_1".into(),
                name: "echo".into(),
                args: serde_json::json!({}),
            },
            content_index: 0,
            output: "ok".into(),
            is_error: false,
        });
        let kinds: Vec<EventKind> = h.log.events().iter().map(StreamEvent::kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::RunStepCreated,
                EventKind::RunStepClosed,
                EventKind::ToolEnd
            ]
        );
    }

    #[test]
    fn replay_drops_deltas_for_closed_steps() {
        let h = harness(UsageMode::Cumulative);
        let mut run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        run.handle_chunk(RawChunk::text("Hello there"));
        run.finish_model(None);
        let closed = h
            .log
            .events()
            .iter()
            .find_map(|event| match event {
                StreamEvent::RunStepClosed { step_id, .. } => Some(step_id.clone()),
                _ => None,
            })
            .expect("closed step");
        let before = h.log.len();

        run.apply(StreamEvent::MessageDelta {
            step_id: closed.clone(),
            part: ContentPart::text("late"),
        });
        assert!(matches!(
            run.diagnostics(),
            [StreamError::StreamDesync { step_id, .. }] if *step_id == closed
        ));
        assert_eq!(h.log.len(), before);
    }

    #[test]
    fn replayed_tool_end_at_the_last_content_index_is_kept() {
        let h = harness(UsageMode::Cumulative);
        let mut run = processor(&h, ProviderKind::OpenAi, StreamConfig::default());
        run.apply(StreamEvent::ToolEnd(ToolEndEvent {
            step_id: "step_replayed".into(),
            tool_call: ToolCall {
                id: "call_9".into(),
                name: "echo".into(),
                args: serde_json::json!({}),
            },
            content_index: usize::MAX,
            output: "ok".into(),
            is_error: false,
        }));
        run.end_run(RunOutcome::Completed);

        let parts = h.content.get_result().expect("complete");
        assert!(matches!(
            parts.as_slice(),
            [ContentPart::ToolCall { output: Some(output), .. }] if output == "ok"
        ));
    }

    #[test]
    fn non_streaming_provider_is_rejected() {
        let profile = ProviderProfile::for_kind(ProviderKind::OpenAi).capabilities(
            crate::provider::Capabilities {
                streaming: false,
                tool_calls: true,
            },
        );
        let result = RunProcessor::new(&StreamConfig::default(), &profile, EventDispatcher::new());
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let result = RunProcessor::new(
            &StreamConfig::default().block_threshold(0),
            &ProviderProfile::for_kind(ProviderKind::OpenAi),
            EventDispatcher::new(),
        );
        assert!(matches!(result, Err(StreamError::Config(_))));
    }
}

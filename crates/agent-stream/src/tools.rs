use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument as _, debug, warn};

use crate::config::StreamConfig;
use crate::content::ToolCall;
use crate::errors::StreamError;
use crate::events::ToolEndEvent;
use crate::runnable::{Runnable, RunnableConfig};
use crate::steps::new_step_id;

/// Failure reported by a tool implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ToolError(pub String);

impl ToolError {
    /// Error with `message` as its text.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Caller-supplied tool implementation.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Name the model uses to request this tool.
    fn name(&self) -> &str;

    /// Runs one call; the returned string is the tool output.
    async fn call(
        &self,
        args: serde_json::Value,
        config: &RunnableConfig,
    ) -> Result<String, ToolError>;
}

/// Resolves the tool set for a batch when tools are scoped per call.
pub type RuntimeToolLoader = Arc<dyn Fn(&[ToolCall]) -> Vec<Arc<dyn Tool>> + Send + Sync>;

/// Where a tool call's result belongs in the event stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolCallStep {
    pub step_id: String,
    pub content_index: usize,
}

/// Executes a batch of resolved tool calls and reports one `ToolEndEvent`
/// per call.
///
/// Calls in one batch run concurrently on the current task; results keep the
/// batch order. With `handle_tool_errors` (the default) unknown tools and tool
/// failures become error content on that call's result; otherwise the first
/// failure is returned and the batch yields no events.
pub struct ToolDispatchNode {
    name: String,
    tags: Vec<String>,
    tool_map: HashMap<String, Arc<dyn Tool>>,
    handle_tool_errors: bool,
    load_runtime_tools: Option<RuntimeToolLoader>,
    tool_call_step_ids: HashMap<String, ToolCallStep>,
    timeout: Option<Duration>,
}

fn index_tools(tools: Vec<Arc<dyn Tool>>) -> HashMap<String, Arc<dyn Tool>> {
    tools
        .into_iter()
        .map(|tool| (tool.name().to_string(), tool))
        .collect()
}

impl ToolDispatchNode {
    /// Node resolving tools by their own names.
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            name: "tools".to_string(),
            tags: Vec::new(),
            tool_map: index_tools(tools),
            handle_tool_errors: true,
            load_runtime_tools: None,
            tool_call_step_ids: HashMap::new(),
            timeout: None,
        }
    }

    /// Node whose error policy follows `config.handle_tool_errors`.
    pub fn from_config(tools: Vec<Arc<dyn Tool>>, config: &StreamConfig) -> Self {
        Self::new(tools).handle_tool_errors(config.handle_tool_errors)
    }

    /// Adds explicit name -> tool entries, overriding same-named tools.
    pub fn tool_map(mut self, map: HashMap<String, Arc<dyn Tool>>) -> Self {
        self.tool_map.extend(map);
        self
    }

    /// Node name used in logs and runnable spans.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Tags added to the node's runnable config.
    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether failures become error content (default) or fail the batch.
    pub fn handle_tool_errors(mut self, handle: bool) -> Self {
        self.handle_tool_errors = handle;
        self
    }

    /// Computes the tool set per batch instead of using the static map.
    pub fn load_runtime_tools(mut self, loader: RuntimeToolLoader) -> Self {
        self.load_runtime_tools = Some(loader);
        self
    }

    /// Known step locations keyed by tool call id.
    pub fn tool_call_step_ids(mut self, steps: HashMap<String, ToolCallStep>) -> Self {
        self.tool_call_step_ids = steps;
        self
    }

    /// Per-call time limit; an elapsed call counts as a tool failure.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Current error policy.
    pub fn handles_tool_errors(&self) -> bool {
        self.handle_tool_errors
    }

    fn resolve_tools(&self, calls: &[ToolCall]) -> HashMap<String, Arc<dyn Tool>> {
        match &self.load_runtime_tools {
            Some(loader) => index_tools(loader(calls)),
            None => self.tool_map.clone(),
        }
    }

    fn location(
        &self,
        call: &ToolCall,
        position: usize,
        step_ids: &HashMap<String, ToolCallStep>,
    ) -> ToolCallStep {
        step_ids
            .get(&call.id)
            .or_else(|| self.tool_call_step_ids.get(&call.id))
            .cloned()
            .unwrap_or_else(|| ToolCallStep {
                step_id: new_step_id(),
                content_index: position,
            })
    }

    async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        call: &ToolCall,
        config: &RunnableConfig,
    ) -> Result<String, StreamError> {
        let span = tracing::info_span!("tool_call", tool = %call.name, call_id = %call.id);
        let run = tool.call(call.args.clone(), config).instrument(span);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => Err(ToolError(format!("timed out after {}ms", limit.as_millis()))),
            },
            None => run.await,
        };
        result.map_err(|e| StreamError::ToolExecution {
            name: call.name.clone(),
            message: e.to_string(),
        })
    }

    /// Runs every call in the batch and returns the tool-end events in batch
    /// order.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCall>,
        config: &RunnableConfig,
    ) -> Result<Vec<ToolEndEvent>, StreamError> {
        self.dispatch_with_steps(calls, &HashMap::new(), config).await
    }

    /// Like [`dispatch`](ToolDispatchNode::dispatch), with call id -> step
    /// locations for this batch taking precedence over the configured ones.
    pub async fn dispatch_with_steps(
        &self,
        calls: Vec<ToolCall>,
        step_ids: &HashMap<String, ToolCallStep>,
        config: &RunnableConfig,
    ) -> Result<Vec<ToolEndEvent>, StreamError> {
        let tools = self.resolve_tools(&calls);
        let config = config.child(&self.tags);

        let mut resolved = Vec::with_capacity(calls.len());
        for call in &calls {
            let tool = tools.get(&call.name).cloned();
            if tool.is_none() && !self.handle_tool_errors {
                return Err(StreamError::UnknownTool {
                    name: call.name.clone(),
                });
            }
            resolved.push(tool);
        }

        let runs = calls.iter().zip(resolved).map(|(call, tool)| {
            let config = &config;
            async move {
                match tool {
                    Some(tool) => self.execute(tool, call, config).await,
                    None => Err(StreamError::UnknownTool {
                        name: call.name.clone(),
                    }),
                }
            }
        });
        let results = futures::future::join_all(runs).await;

        let mut events = Vec::with_capacity(calls.len());
        for (position, (call, result)) in calls.into_iter().zip(results).enumerate() {
            let location = self.location(&call, position, step_ids);
            let (output, is_error) = match result {
                Ok(output) => (output, false),
                Err(err) if self.handle_tool_errors => {
                    warn!(node = %self.name, tool = %call.name, call_id = %call.id, error = %err, "tool error converted to content");
                    (format!("Error: {err}\n Please fix your mistakes."), true)
                }
                Err(err) => return Err(err),
            };
            debug!(node = %self.name, tool = %call.name, call_id = %call.id, is_error, "tool call finished");
            events.push(ToolEndEvent {
                step_id: location.step_id,
                tool_call: call,
                content_index: location.content_index,
                output,
                is_error,
            });
        }
        Ok(events)
    }
}

#[async_trait::async_trait]
impl Runnable for ToolDispatchNode {
    type Input = Vec<ToolCall>;
    type Output = Vec<ToolEndEvent>;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn invoke(
        &self,
        input: Vec<ToolCall>,
        config: &RunnableConfig,
    ) -> Result<Vec<ToolEndEvent>, StreamError> {
        self.dispatch(input, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    #[async_trait::async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn call(
            &self,
            args: serde_json::Value,
            _config: &RunnableConfig,
        ) -> Result<String, ToolError> {
            Ok(args.to_string())
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn call(
            &self,
            _args: serde_json::Value,
            _config: &RunnableConfig,
        ) -> Result<String, ToolError> {
            Err(ToolError::new("disk on fire"))
        }
    }

    struct Slow;

    #[async_trait::async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn call(
            &self,
            _args: serde_json::Value,
            _config: &RunnableConfig,
        ) -> Result<String, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".into())
        }
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            args: serde_json::json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn results_attach_to_their_originating_call_and_step() {
        let node = ToolDispatchNode::new(vec![Arc::new(Echo)]).tool_call_step_ids(HashMap::from([(
            "a".to_string(),
            ToolCallStep {
                step_id: "step_tools".into(),
                content_index: 3,
            },
        )]));
        let events = node
            .dispatch(vec![call("a", "echo"), call("b", "echo")], &RunnableConfig::default())
            .await
            .expect("dispatch");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tool_call.id, "a");
        assert_eq!(events[0].step_id, "step_tools");
        assert_eq!(events[0].content_index, 3);
        assert_eq!(events[0].output, "{\"id\":\"a\"}");
        assert_eq!(events[1].tool_call.id, "b");
        assert!(events[1].step_id.starts_with("step_"));
        assert_eq!(events[1].content_index, 1);
    }

    #[tokio::test]
    async fn handled_failures_become_error_content() {
        let node = ToolDispatchNode::new(vec![Arc::new(Broken) as Arc<dyn Tool>, Arc::new(Echo)]);
        let events = node
            .dispatch(
                vec![call("a", "broken"), call("b", "missing"), call("c", "echo")],
                &RunnableConfig::default(),
            )
            .await
            .expect("handled");
        assert!(events[0].is_error);
        assert!(events[0].output.contains("disk on fire"));
        assert!(events[1].is_error);
        assert!(events[1].output.contains("unknown tool: missing"));
        assert!(!events[2].is_error);
    }

    #[tokio::test]
    async fn tool_map_entries_override_and_alias_tools() {
        let node = ToolDispatchNode::new(vec![Arc::new(Echo)]).tool_map(HashMap::from([
            ("echo".to_string(), Arc::new(Broken) as Arc<dyn Tool>),
            ("repeat".to_string(), Arc::new(Echo) as Arc<dyn Tool>),
        ]));
        let events = node
            .dispatch(vec![call("a", "echo"), call("b", "repeat")], &RunnableConfig::default())
            .await
            .expect("handled");
        assert!(events[0].is_error);
        assert!(events[0].output.contains("disk on fire"));
        assert!(!events[1].is_error);
        assert_eq!(events[1].output, "{\"id\":\"b\"}");
    }

    #[tokio::test]
    async fn unhandled_unknown_tool_is_fatal() {
        let node = ToolDispatchNode::new(vec![Arc::new(Echo)]).handle_tool_errors(false);
        let err = node
            .dispatch(vec![call("a", "missing")], &RunnableConfig::default())
            .await
            .expect_err("fatal");
        assert_eq!(err, StreamError::UnknownTool { name: "missing".into() });
    }

    #[tokio::test]
    async fn unhandled_tool_failure_propagates() {
        let node = ToolDispatchNode::new(vec![Arc::new(Broken)]).handle_tool_errors(false);
        let err = node
            .dispatch(vec![call("a", "broken")], &RunnableConfig::default())
            .await
            .expect_err("fatal");
        assert!(matches!(err, StreamError::ToolExecution { name, .. } if name == "broken"));
    }

    #[test]
    fn error_policy_follows_stream_config() {
        let strict = StreamConfig::default().handle_tool_errors(false);
        assert!(!ToolDispatchNode::from_config(Vec::new(), &strict).handles_tool_errors());
        assert!(ToolDispatchNode::from_config(Vec::new(), &StreamConfig::default()).handles_tool_errors());
    }

    #[tokio::test]
    async fn runtime_loader_scopes_tools_per_batch() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let node = ToolDispatchNode::new(Vec::new()).load_runtime_tools(Arc::new(
            move |calls: &[ToolCall]| {
                counter.fetch_add(calls.len(), Ordering::SeqCst);
                vec![Arc::new(Echo) as Arc<dyn Tool>]
            },
        ));
        let events = node
            .invoke(vec![call("a", "echo")], &RunnableConfig::default())
            .await
            .expect("dispatch");
        assert!(!events[0].is_error);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let node = ToolDispatchNode::new(vec![Arc::new(Slow)]).timeout(Duration::from_millis(10));
        let events = node
            .dispatch(vec![call("a", "slow")], &RunnableConfig::default())
            .await
            .expect("handled");
        assert!(events[0].is_error);
        assert!(events[0].output.contains("timed out"));
    }
}

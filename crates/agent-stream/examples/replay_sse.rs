use std::sync::Arc;

use agent_stream::prelude::*;
use agent_stream::transport::sse_chunk_stream;

const TRANSCRIPT: &str = concat!(
    "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"<think>The user wants \"}}]}\n\n",
    "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"the time.</think>Let me check.\"}}]}\n\n",
    "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"clock\",\"arguments\":\"{\\\"tz\\\":\"}}]}}]}\n\n",
    "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"\\\"UTC\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
    "data: {\"id\":\"c1\",\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":9,\"total_tokens\":21}}\n\n",
    "data: [DONE]\n\n",
);

struct Clock;

#[async_trait::async_trait]
impl Tool for Clock {
    fn name(&self) -> &str {
        "clock"
    }

    async fn call(
        &self,
        args: serde_json::Value,
        _config: &RunnableConfig,
    ) -> Result<String, ToolError> {
        let tz = args["tz"]
            .as_str()
            .ok_or_else(|| ToolError::new("missing tz"))?;
        Ok(format!("12:00 {tz}"))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    agent_stream::init_observability();

    let registry = ProviderRegistry::with_builtins();
    let profile = registry.resolve("openai")?;

    let content = ContentAggregator::new();
    let usage = MetadataAggregator::new(profile.usage_mode);
    let mut dispatcher = EventDispatcher::new();
    content.attach(&mut dispatcher);
    usage.attach(&mut dispatcher);
    dispatcher.register_many(
        &[EventKind::RunStepCreated, EventKind::ToolEnd, EventKind::RunEnd],
        Arc::new(|event: &StreamEvent| println!("{}", event.kind())),
    );

    // Split reads at arbitrary byte offsets, like a real socket would.
    let reads: Vec<Result<bytes::Bytes, std::io::Error>> = TRANSCRIPT
        .as_bytes()
        .chunks(37)
        .map(|chunk| Ok(bytes::Bytes::copy_from_slice(chunk)))
        .collect();
    let chunks = sse_chunk_stream(futures::stream::iter(reads));

    let config = StreamConfig::from_env()?;
    let tools = ToolDispatchNode::from_config(vec![Arc::new(Clock)], &config);
    let processor = RunProcessor::new(&config, profile, dispatcher)?;
    let summary = processor.run(chunks, Some(&tools)).await?;

    let parts = content
        .get_result()
        .map_err(|e| StreamError::producer(e.to_string()))?;
    for part in &parts {
        match part {
            ContentPart::Reasoning { text } => println!("reasoning: {text}"),
            ContentPart::Text { text } => println!("text: {text}"),
            ContentPart::ToolCall { name, output, .. } => {
                println!("tool {}: {}", name.as_deref().unwrap_or("?"), output.as_deref().unwrap_or(""));
            }
            ContentPart::Artifact { value } => println!("artifact: {value}"),
        }
    }
    let total = usage
        .get_result()
        .map_err(|e| StreamError::producer(e.to_string()))?;
    println!(
        "{} steps, {} tokens, {} diagnostics",
        summary.steps,
        total.total_tokens,
        summary.diagnostics.len()
    );
    Ok(())
}

//! Boundary contract for participating as a node in the external workflow
//! graph.

use std::future::Future;

use futures::future::BoxFuture;
use tracing::Instrument as _;

use crate::errors::StreamError;

/// Invocation settings forwarded by the workflow graph.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunnableConfig {
    pub run_id: Option<uuid::Uuid>,
    pub tags: Vec<String>,
    /// Free-form configurable values passed through untouched.
    pub configurable: serde_json::Map<String, serde_json::Value>,
}

impl RunnableConfig {
    /// Config carrying only a run id.
    pub fn for_run(run_id: uuid::Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }

    /// Config handed to a child node: parent tags followed by the node's own.
    pub fn child(&self, tags: &[String]) -> Self {
        let mut child = self.clone();
        for tag in tags {
            if !child.tags.contains(tag) {
                child.tags.push(tag.clone());
            }
        }
        child
    }
}

/// A node the workflow graph can invoke.
#[async_trait::async_trait]
pub trait Runnable: Send + Sync {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn tags(&self) -> &[String] {
        &[]
    }

    async fn invoke(
        &self,
        input: Self::Input,
        config: &RunnableConfig,
    ) -> Result<Self::Output, StreamError>;
}

type CallableFn<I, O> =
    Box<dyn Fn(I, RunnableConfig) -> BoxFuture<'static, Result<O, StreamError>> + Send + Sync>;

/// Adapts a plain async function into a [`Runnable`].
///
/// With tracing enabled (the default) each invocation runs inside a
/// `runnable` span carrying the node name, run id and merged tags.
pub struct RunnableCallable<I, O> {
    name: String,
    tags: Vec<String>,
    trace: bool,
    func: CallableFn<I, O>,
}

impl<I, O> RunnableCallable<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Wraps `func` as a node named `name`.
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(I, RunnableConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StreamError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            tags: Vec::new(),
            trace: true,
            func: Box::new(move |input, config| Box::pin(func(input, config))),
        }
    }

    /// Tags appended to the caller's tags on every invocation.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Disables the per-invocation span when false.
    pub fn trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }
}

#[async_trait::async_trait]
impl<I, O> Runnable for RunnableCallable<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &[String] {
        &self.tags
    }

    async fn invoke(&self, input: I, config: &RunnableConfig) -> Result<O, StreamError> {
        let child = config.child(&self.tags);
        if !self.trace {
            return (self.func)(input, child).await;
        }
        let span = tracing::info_span!(
            "runnable",
            node = %self.name,
            run_id = ?child.run_id,
            tags = ?child.tags,
        );
        (self.func)(input, child).instrument(span).await
    }
}

//! Model provider contract.
//!
//! The runtime only needs two things from a model: a one-shot
//! [`complete`](ModelProvider::complete) and an incremental
//! [`stream`](ModelProvider::stream). Providers that cannot stream get a
//! default `stream` that replays the completed response as deltas.

pub mod openrouter;
pub mod scripted;
pub mod stream;

pub use openrouter::OpenRouterProvider;
pub use scripted::{ScriptStep, ScriptedProvider};
pub use stream::{StreamAccumulator, StreamEvent};

use crate::error::ProviderError;
use crate::{Message, ToolCall, ToolDef, UsageInfo};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by provider methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Stream of deltas for one model call.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

/// What the runtime sends for one model call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

/// A finished model response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<UsageInfo>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(UsageInfo {
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
            total_tokens: Some(prompt_tokens + completion_tokens),
        });
        self
    }

    /// Replay this completion as the deltas a streaming provider would send.
    pub fn into_events(self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if let Some(text) = self.content.filter(|t| !t.is_empty()) {
            events.push(StreamEvent::TextDelta(text));
        }
        for (index, call) in self.tool_calls.into_iter().enumerate() {
            events.push(StreamEvent::ToolCallDelta {
                index,
                id: Some(call.id),
                name: Some(call.function.name),
                arguments_delta: call.function.arguments,
            });
        }
        if let Some(usage) = self.usage {
            events.push(StreamEvent::Usage(usage));
        }
        events.push(StreamEvent::Done);
        events
    }
}

/// A chat model the runtime can query.
///
/// Uses boxed futures so the trait stays dyn-compatible; agents hold an
/// `Arc<dyn ModelProvider>`.
pub trait ModelProvider: Send + Sync {
    /// Model identifier, used for pricing lookups and logging.
    fn model_id(&self) -> &str;

    /// Context window in tokens, when known.
    fn context_limit(&self) -> Option<u64> {
        None
    }

    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> ProviderFuture<'a, Completion>;

    fn stream<'a>(&'a self, request: &'a CompletionRequest) -> ProviderFuture<'a, DeltaStream> {
        Box::pin(async move {
            let completion = self.complete(request).await?;
            let events = completion
                .into_events()
                .into_iter()
                .map(Ok::<StreamEvent, ProviderError>);
            Ok(Box::pin(futures::stream::iter(events)) as DeltaStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct Fixed;

    impl ModelProvider for Fixed {
        fn model_id(&self) -> &str {
            "fixed"
        }

        fn complete<'a>(&'a self, _request: &'a CompletionRequest) -> ProviderFuture<'a, Completion> {
            Box::pin(async {
                Ok(Completion {
                    content: Some("hello".into()),
                    tool_calls: vec![ToolCall::new("c1", "add", r#"{"a":1,"b":2}"#)],
                    usage: None,
                })
            })
        }
    }

    #[tokio::test]
    async fn default_stream_replays_completion() {
        let request = CompletionRequest {
            model: "fixed".into(),
            messages: vec![],
            tools: vec![],
        };
        let mut stream = Fixed.stream(&request).await.unwrap();
        let mut acc = StreamAccumulator::default();
        while let Some(event) = stream.next().await {
            acc.push(event.unwrap());
        }
        let completion = acc.finish();
        assert_eq!(completion.content.as_deref(), Some("hello"));
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].id, "c1");
    }
}

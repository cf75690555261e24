//! A provider that replays a fixed script of responses.
//!
//! Used by tests and by the `cadre --demo` mode. Every request is recorded
//! so callers can assert on what the runtime sent.

use super::{Completion, CompletionRequest, DeltaStream, ModelProvider, ProviderFuture, StreamEvent};
use crate::error::ProviderError;
use crate::ToolCall;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// One scripted model turn.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Respond with this completion.
    Reply(Completion),
    /// Respond after a delay.
    Delayed(Duration, Completion),
    /// Fail with a provider error.
    Fail(String),
    /// Never respond.
    Stall,
}

/// Replays [`ScriptStep`]s in order; fails once the script is exhausted.
#[derive(Debug)]
pub struct ScriptedProvider {
    model: String,
    context_limit: Option<u64>,
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            context_limit: None,
            steps: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_context_limit(mut self, limit: u64) -> Self {
        self.context_limit = Some(limit);
        self
    }

    pub fn then(self, step: ScriptStep) -> Self {
        self.push(step);
        self
    }

    /// Script a text-only reply.
    pub fn then_text(self, content: impl Into<String>) -> Self {
        self.then(ScriptStep::Reply(Completion::text(content)))
    }

    /// Script a reply requesting tool calls.
    pub fn then_calls(self, calls: Vec<ToolCall>) -> Self {
        self.then(ScriptStep::Reply(Completion::tool_calls(calls)))
    }

    pub fn then_fail(self, message: impl Into<String>) -> Self {
        self.then(ScriptStep::Fail(message.into()))
    }

    pub fn then_stall(self) -> Self {
        self.then(ScriptStep::Stall)
    }

    /// Append a step to a provider that is already shared.
    pub fn push(&self, step: ScriptStep) {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_step(&self, request: &CompletionRequest) -> Option<ScriptStep> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    async fn respond(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let step = self.next_step(request);
        debug!(
            "Scripted model {}: {} message(s), {} tool(s)",
            self.model,
            request.messages.len(),
            request.tools.len()
        );
        match step {
            Some(ScriptStep::Reply(completion)) => Ok(completion),
            Some(ScriptStep::Delayed(delay, completion)) => {
                tokio::time::sleep(delay).await;
                Ok(completion)
            }
            Some(ScriptStep::Fail(message)) => Err(ProviderError::Other(message)),
            Some(ScriptStep::Stall) => futures::future::pending().await,
            None => Err(ProviderError::Other("script exhausted".into())),
        }
    }
}

/// Split text into word-sized chunks, keeping the separators.
fn chunk_words(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

impl ModelProvider for ScriptedProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn context_limit(&self) -> Option<u64> {
        self.context_limit
    }

    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> ProviderFuture<'a, Completion> {
        Box::pin(self.respond(request))
    }

    fn stream<'a>(&'a self, request: &'a CompletionRequest) -> ProviderFuture<'a, DeltaStream> {
        Box::pin(async move {
            let completion = self.respond(request).await?;
            let mut events: Vec<StreamEvent> = completion
                .content
                .as_deref()
                .map(chunk_words)
                .unwrap_or_default()
                .into_iter()
                .map(StreamEvent::TextDelta)
                .collect();
            let rest = Completion {
                content: None,
                ..completion
            };
            events.extend(rest.into_events());
            let stream = futures::stream::iter(events.into_iter().map(Ok::<_, ProviderError>));
            Ok(Box::pin(stream) as DeltaStream)
        })
    }
}

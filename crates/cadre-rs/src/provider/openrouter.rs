//! OpenRouter chat-completions adapter.

use super::{
    Completion, CompletionRequest, DeltaStream, ModelProvider, ProviderFuture, StreamEvent,
};
use crate::error::ProviderError;
use crate::{Message, ToolCall, ToolDef, UsageInfo};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Serialize, Debug)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolDef],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

fn no_tools(tools: &&[ToolDef]) -> bool {
    tools.is_empty()
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// [`ModelProvider`] backed by the OpenRouter API.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    context_limit: Option<u64>,
}

impl std::fmt::Debug for OpenRouterProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterProvider")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("cadre-rs/0.1")
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: None,
            temperature: None,
            context_limit: None,
        })
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_context_limit(mut self, limit: u64) -> Self {
        self.context_limit = Some(limit);
        self
    }

    fn body<'a>(&'a self, request: &'a CompletionRequest, stream: bool) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: &request.messages,
            tools: &request.tools,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, ProviderError> {
        debug!(
            "LLM request: model={}, messages={}, tools={}, stream={}",
            body.model,
            body.messages.len(),
            body.tools.len(),
            body.stream
        );
        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn chat(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let start = Instant::now();
        let resp = self.send(&self.body(request, false)).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Request(format!("failed to read response: {e}")))?;
        debug!(
            "LLM response in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(ProviderError::Other(format!("OpenRouter API error: {}", err.message)));
        }

        let message = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .map(|c| c.message);
        Ok(match message {
            Some(m) => Completion {
                content: m.content,
                tool_calls: m.tool_calls.unwrap_or_default(),
                usage: parsed.usage,
            },
            None => Completion {
                usage: parsed.usage,
                ..Default::default()
            },
        })
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<DeltaStream, ProviderError> {
        let resp = self.send(&self.body(request, true)).await?;
        let state = SseState {
            resp,
            buffer: String::new(),
            pending: VecDeque::new(),
            finished: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            let item = state.next_event().await?;
            Some((item, state))
        });
        Ok(Box::pin(stream))
    }
}

struct SseState {
    resp: reqwest::Response,
    buffer: String,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl SseState {
    async fn next_event(&mut self) -> Option<Result<StreamEvent, ProviderError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.resp.chunk().await {
                Ok(Some(bytes)) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    self.drain_lines();
                }
                Ok(None) => {
                    let rest = std::mem::take(&mut self.buffer);
                    self.handle_line(rest.trim());
                    if !self.finished {
                        self.pending.push_back(StreamEvent::Done);
                        self.finished = true;
                    }
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(ProviderError::Request(format!(
                        "failed to read streaming chunk: {e}"
                    ))));
                }
            }
        }
    }

    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.handle_line(line.trim());
            if self.finished {
                break;
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        if line == "data: [DONE]" {
            self.pending.push_back(StreamEvent::Done);
            self.finished = true;
            return;
        }
        if let Some(data) = line.strip_prefix("data: ") {
            parse_sse_data(data, &mut self.pending);
        }
    }
}

fn parse_sse_data(data: &str, events: &mut VecDeque<StreamEvent>) {
    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e}");
            return;
        }
    };
    if let Some(usage) = chunk.usage {
        events.push_back(StreamEvent::Usage(usage));
    }
    for delta in chunk.choices.into_iter().flatten().filter_map(|c| c.delta) {
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            events.push_back(StreamEvent::TextDelta(content));
        }
        if let Some(reasoning) = delta.reasoning.filter(|r| !r.is_empty()) {
            events.push_back(StreamEvent::ReasoningDelta(reasoning));
        }
        for tc in delta.tool_calls.into_iter().flatten() {
            let func = tc.function.unwrap_or_default();
            events.push_back(StreamEvent::ToolCallDelta {
                index: tc.index.unwrap_or(0),
                id: tc.id,
                name: func.name,
                arguments_delta: func.arguments.unwrap_or_default(),
            });
        }
    }
    trace!("SSE chunk parsed, {} pending event(s)", events.len());
}

impl ModelProvider for OpenRouterProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn context_limit(&self) -> Option<u64> {
        self.context_limit
    }

    fn complete<'a>(&'a self, request: &'a CompletionRequest) -> ProviderFuture<'a, Completion> {
        Box::pin(self.chat(request))
    }

    fn stream<'a>(&'a self, request: &'a CompletionRequest) -> ProviderFuture<'a, DeltaStream> {
        Box::pin(self.open_stream(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_text_and_tool_deltas() {
        let mut events = VecDeque::new();
        parse_sse_data(
            r#"{"choices":[{"delta":{"content":"Hi","tool_calls":[{"index":0,"id":"c1","function":{"name":"add","arguments":"{\"a\""}}]}}]}"#,
            &mut events,
        );
        assert_eq!(events.pop_front(), Some(StreamEvent::TextDelta("Hi".into())));
        match events.pop_front() {
            Some(StreamEvent::ToolCallDelta { index, id, name, arguments_delta }) => {
                assert_eq!(index, 0);
                assert_eq!(id.as_deref(), Some("c1"));
                assert_eq!(name.as_deref(), Some("add"));
                assert_eq!(arguments_delta, r#"{"a""#);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn sse_usage_chunk() {
        let mut events = VecDeque::new();
        parse_sse_data(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":2,"total_tokens":12}}"#,
            &mut events,
        );
        assert!(matches!(events.pop_front(), Some(StreamEvent::Usage(u)) if u.prompt_tokens == Some(10)));
    }

    #[test]
    fn malformed_chunk_is_skipped() {
        let mut events = VecDeque::new();
        parse_sse_data("not json", &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn request_body_omits_empty_tools() {
        let provider = OpenRouterProvider::new("key", "anthropic/claude-sonnet-4").unwrap();
        let request = CompletionRequest {
            model: "anthropic/claude-sonnet-4".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
        };
        let json = serde_json::to_value(provider.body(&request, false)).unwrap();
        assert!(json.get("tools").is_none());
        assert!(json.get("stream").is_none());
        assert_eq!(json["model"], "anthropic/claude-sonnet-4");
    }
}

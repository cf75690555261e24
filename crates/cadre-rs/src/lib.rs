//! Multi-agent execution runtime for LLM tool-use teams.
//!
//! `cadre-rs` drives conversations between a caller and a language model,
//! interleaving model calls with tool execution. A [`Team`](agent::Team) of
//! [`Agent`](agent::Agent)s shares a [`Session`](session::Session); the
//! [`Runtime`](runtime::Runtime) runs the turn loop for the active agent,
//! gates sensitive tool calls behind human confirmation, hands tasks to
//! sub-agents and reports everything it does as a typed event stream.
//!
//! # Getting started
//!
//! ```ignore
//! use cadre_rs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Arc::new(OpenRouterProvider::new(std::env::var("OPENROUTER_KEY")?, DEFAULT_MODEL)?);
//!
//!     let tools = ToolSet::new().with(ThinkTool);
//!     let root = Agent::new("root", model)
//!         .with_instruction("You are a helpful assistant.")
//!         .with_tools(tools);
//!
//!     let runtime = Runtime::new(Team::single(root))
//!         .with_event_handler(LoggingHandler);
//!
//!     let session = Session::new();
//!     session.append(Message::user("What is 1 + 2?"));
//!
//!     let mut events = runtime.run_stream(&session)?;
//!     while let Some(event) = events.recv().await {
//!         if let Event::AgentChoice { delta, .. } = &event {
//!             print!("{delta}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`session`] | Shared conversation history, typed state bag, usage totals |
//! | [`provider`] | [`ModelProvider`](provider::ModelProvider) contract, delta accumulation, OpenRouter and scripted providers |
//! | [`tools`] | [`Tool`](tools::Tool) trait, [`ToolSet`](tools::ToolSet) registry, remote tools, permissions |
//! | [`agent`] | [`Agent`](agent::Agent), [`Team`](agent::Team) and prompt formatting |
//! | [`runtime`] | Turn-loop state machine, confirmation gating, delegation, events |
//! | [`usage`] | Per-model pricing and context estimation |
//! | [`error`] | Error taxonomy |

pub mod agent;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod runtime;
pub mod session;
pub mod tools;
pub mod usage;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use tools::ThinkTool;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default model for agents built by the `cadre` binary.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` for a type implementing
/// `schemars::JsonSchema`, ready to be used as a tool's parameter schema.
///
/// # Example
///
/// ```
/// use cadre_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct AddArgs {
///     a: i64,
///     b: i64,
/// }
///
/// let schema = json_schema_for::<AddArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"a".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// A message in the conversation, in chat-completions shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub role: MessageRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::Assistant, content)
    }

    /// Assistant turn carrying optional text alongside tool calls. An empty
    /// call list is stored as `None` so text-only turns serialize cleanly.
    pub fn assistant(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }

    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Tool calls requested by this message (empty for non-assistant turns).
    pub fn calls(&self) -> &[ToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }

    /// Text content, or `""` when absent.
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or_default()
    }
}

// ── Tool wire types ────────────────────────────────────────────────

/// The type of a tool definition. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ToolType {
    #[serde(rename = "function")]
    Function,
}

/// Tool schema as sent to the model (OpenAI function-calling format).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub tool_type: ToolType,
    pub function: FunctionDef,
}

impl ToolDef {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            tool_type: ToolType::Function,
            function: FunctionDef {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The type of a tool call. Currently always `Function`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CallType {
    #[serde(rename = "function")]
    Function,
}

/// A tool call requested by the model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub function: FunctionCallData,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: CallType::Function,
            function: FunctionCallData {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }

    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct FunctionCallData {
    pub name: String,
    pub arguments: String,
}

/// Token usage reported by a provider for one model call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.text(), "hello");

        let tool = Message::tool_result("call-1", "result");
        assert_eq!(tool.role, MessageRole::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn assistant_without_calls_omits_tool_calls() {
        let msg = Message::assistant(Some("done".into()), vec![]);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("tool_calls").is_none());
        assert_eq!(json["content"], "done");
    }

    #[test]
    fn tool_call_wire_shape() {
        let call = ToolCall::new("c1", "add", r#"{"a":1}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "add");
        assert_eq!(call.name(), "add");
    }
}

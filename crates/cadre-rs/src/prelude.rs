//! Convenience re-exports for common `cadre-rs` types.
//!
//! ```ignore
//! use cadre_rs::prelude::*;
//! ```
//!
//! Covers building a team, running it and reacting to its events. Remote
//! transports, stream deltas and pricing live in their modules.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{DEFAULT_MODEL, Message, MessageRole, ToolCall, json_schema_for};

// ── Agents & runtime ────────────────────────────────────────────────
pub use crate::agent::{Agent, Team};
pub use crate::error::{RuntimeError, ToolError};
pub use crate::runtime::{
    CompositeEventHandler, Event, EventHandler, EventStream, FnEventHandler, LoggingHandler,
    NoopHandler, ResumeDecision, RunOutcome, Runtime, RuntimeConfig,
};
pub use crate::session::{Session, StateEntry, StateKey, Usage};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::provider::{ModelProvider, OpenRouterProvider, ScriptedProvider};

// ── Tools ───────────────────────────────────────────────────────────
pub use crate::tools::{
    FnTool, PermissionsConfig, ThinkTool, Tool, ToolDefinition, ToolFuture, ToolResult, ToolSet,
    parse_tool_args,
};

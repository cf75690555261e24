//! Tool abstraction and registry.
//!
//! The [`Tool`] trait describes one capability: a static
//! [`ToolDefinition`] (schema plus confirmation policy) and an async
//! `execute`. Tools are collected into a [`ToolSet`], which handles
//! lookup, argument validation, timeouts and result truncation.

use crate::error::ToolError;
use crate::{ToolCall, ToolDef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Maximum size (in bytes) for tool output before truncation.
pub const DEFAULT_MAX_RESULT_BYTES: usize = 30_000;

/// Recorded in place of an empty tool output.
pub const EMPTY_OUTPUT: &str = "(no output)";

/// Default category for tools that do not declare one.
pub const DEFAULT_CATEGORY: &str = "general";

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send + 'a>>;

// ── Definition & result ────────────────────────────────────────────

/// Static description of a tool: its schema and confirmation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub category: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: serde_json::Value,
    /// Ask the user before each execution unless a standing approval exists.
    #[serde(default)]
    pub requires_confirmation: bool,
    /// The tool has no side effects. Read-only tools never need confirmation.
    #[serde(default)]
    pub read_only: bool,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            category: DEFAULT_CATEGORY.into(),
            description: description.into(),
            parameters,
            requires_confirmation: false,
            read_only: false,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn requiring_confirmation(mut self) -> Self {
        self.requires_confirmation = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Schema in the shape the model API expects.
    pub fn to_tool_def(&self) -> ToolDef {
        ToolDef::new(&self.name, &self.description, self.parameters.clone())
    }
}

/// Outcome of a tool call as recorded in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

impl From<&ToolError> for ToolResult {
    fn from(err: &ToolError) -> Self {
        ToolResult::error(format!("Error: {err}"))
    }
}

// ── Tool trait ─────────────────────────────────────────────────────

/// A capability the model can invoke through function calling.
///
/// `execute` receives the raw JSON argument string. Failures the model can
/// act on should be returned as [`ToolResult::error`] or as a recoverable
/// [`ToolError`]; only [`ToolError::Transport`] aborts a run.
///
/// Uses a boxed future so the trait is dyn-compatible.
///
/// # Example
///
/// ```ignore
/// struct Clock;
///
/// impl Tool for Clock {
///     fn definition(&self) -> ToolDefinition {
///         ToolDefinition::new("now", "Current UTC time", json!({"type": "object"})).read_only()
///     }
///
///     fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
///         Box::pin(async { Ok(ToolResult::ok(chrono::Utc::now().to_rfc3339())) })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    fn execute(&self, arguments: &str) -> ToolFuture<'_>;

    fn name(&self) -> String {
        self.definition().name
    }

    /// Extra system-prompt text describing how to use this tool.
    fn instructions(&self) -> Option<String> {
        None
    }
}

// ── ToolSet ────────────────────────────────────────────────────────

/// Default timeout for tool execution (60 seconds).
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// A registry of tools dispatched by name.
///
/// # Example
///
/// ```ignore
/// let tools = ToolSet::new()
///     .with_arg_validation(true)
///     .with_default_timeout(Some(Duration::from_secs(30)))
///     .with_confirmation_category("shell")
///     .with(ThinkTool)
///     .with(add_tool());
/// ```
pub struct ToolSet {
    tools: BTreeMap<String, Box<dyn Tool>>,
    max_result_bytes: usize,
    validate_args: bool,
    default_timeout: Option<Duration>,
    /// Categories whose tools all require confirmation.
    confirm_categories: BTreeSet<String>,
}

impl fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSet")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("max_result_bytes", &self.max_result_bytes)
            .field("confirm_categories", &self.confirm_categories)
            .finish()
    }
}

impl Default for ToolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
            max_result_bytes: DEFAULT_MAX_RESULT_BYTES,
            validate_args: false,
            default_timeout: Some(DEFAULT_TOOL_TIMEOUT),
            confirm_categories: BTreeSet::new(),
        }
    }

    pub fn with_max_result_bytes(mut self, max: usize) -> Self {
        self.max_result_bytes = max;
        self
    }

    /// Validate arguments against each tool's JSON Schema before execution.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    /// Timeout applied to every execution. `None` disables timeouts.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Require confirmation for every tool in `category`.
    pub fn with_confirmation_category(mut self, category: impl Into<String>) -> Self {
        self.confirm_categories.insert(category.into());
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_boxed(Box::new(tool));
    }

    pub fn register_boxed(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name();
        if self.tools.insert(name.clone(), tool).is_some() {
            debug!("Tool {name} re-registered, previous definition replaced");
        }
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// Every tool's definition, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Schemas for the model API.
    pub fn schemas(&self) -> Vec<ToolDef> {
        self.tools
            .values()
            .map(|t| t.definition().to_tool_def())
            .collect()
    }

    /// System-prompt additions contributed by tools.
    pub fn instructions(&self) -> Vec<String> {
        self.tools.values().filter_map(|t| t.instructions()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Whether calling `name` needs a confirmation, ignoring standing
    /// approvals. Unknown tools never do.
    pub fn requires_confirmation(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| {
            let def = t.definition();
            !def.read_only
                && (def.requires_confirmation || self.confirm_categories.contains(&def.category))
        })
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.definition().read_only)
    }

    /// Execute a call with optional validation, a timeout and truncation.
    ///
    /// Unknown tools, invalid arguments and timeouts come back as
    /// recoverable [`ToolError`]s. Empty output is replaced by
    /// [`EMPTY_OUTPUT`].
    pub async fn execute(&self, call: &ToolCall) -> Result<ToolResult, ToolError> {
        let name = call.name();
        let arguments = call.arguments();
        let tool = self.tools.get(name).ok_or_else(|| ToolError::Unavailable {
            tool: name.to_string(),
            agent: "-".into(),
        })?;

        if self.validate_args {
            validate_tool_arguments(tool.as_ref(), arguments)?;
        }

        log_tool_call(name, arguments);
        let start = Instant::now();

        let result = match self.default_timeout {
            Some(limit) => match tokio::time::timeout(limit, tool.execute(arguments)).await {
                Ok(r) => r,
                Err(_) => {
                    info!(
                        "Tool {name} timed out after {:.1}s (limit: {:.0}s)",
                        start.elapsed().as_secs_f64(),
                        limit.as_secs_f64(),
                    );
                    Err(ToolError::Timeout {
                        tool: name.to_string(),
                        after: limit,
                    })
                }
            },
            None => tool.execute(arguments).await,
        };

        let mut result = result?;
        debug!(
            "Tool {name} completed in {:.0}ms ({} bytes{})",
            start.elapsed().as_secs_f64() * 1000.0,
            result.output.len(),
            if result.is_error { ", error" } else { "" }
        );
        trace!("Tool {name} result preview: {}", preview(&result.output, 300));

        if result.output.trim().is_empty() {
            result.output = EMPTY_OUTPUT.to_string();
        }
        result.output = truncate_result(result.output, self.max_result_bytes);
        Ok(result)
    }
}

// ── FnTool ─────────────────────────────────────────────────────────

type ErasedToolHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send>> + Send + Sync>;

/// A closure-based tool with typed arguments.
///
/// The handler receives arguments deserialized into `A` and returns
/// `Ok(output)` or `Err(message)`; the message becomes a recoverable
/// execution error that the model sees.
///
/// # Example
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct AddArgs { a: i64, b: i64 }
///
/// let add = FnTool::new(
///     ToolDefinition::new("add", "Add two integers", json_schema_for::<AddArgs>()).read_only(),
///     |args: AddArgs| async move { Ok((args.a + args.b).to_string()) },
/// );
/// ```
pub struct FnTool {
    def: ToolDefinition,
    handler: ErasedToolHandler,
}

impl FnTool {
    pub fn new<A, F, Fut>(def: ToolDefinition, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let tool_name = def.name.clone();
        let erased = move |raw: String| -> Pin<Box<dyn Future<Output = Result<ToolResult, ToolError>> + Send>> {
            let tool = tool_name.clone();
            let args: A = match parse_tool_args(&tool, &raw) {
                Ok(a) => a,
                Err(e) => return Box::pin(async move { Err(e) }),
            };
            let fut = handler(args);
            Box::pin(async move {
                fut.await
                    .map(ToolResult::ok)
                    .map_err(|reason| ToolError::Execution { tool, reason })
            })
        };
        Self {
            def,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDefinition {
        self.def.clone()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        (self.handler)(arguments.to_string())
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool").field("name", &self.def.name).finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Validate arguments against the tool's declared JSON Schema.
pub fn validate_tool_arguments(tool: &dyn Tool, arguments: &str) -> Result<(), ToolError> {
    let def = tool.definition();
    let value: serde_json::Value =
        serde_json::from_str(arguments).map_err(|e| ToolError::InvalidArguments {
            tool: def.name.clone(),
            reason: format!("invalid JSON: {e}"),
        })?;

    // An invalid schema is the tool author's problem; skip validation.
    let Ok(validator) = jsonschema::validator_for(&def.parameters) else {
        return Ok(());
    };

    let errors: Vec<String> = validator
        .iter_errors(&value)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: def.name,
            reason: errors.join("; "),
        })
    }
}

/// Parse raw JSON arguments into a typed struct.
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    arguments: &str,
) -> Result<T, ToolError> {
    let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    info!(
        "[tool] {name}({}{})",
        preview(arguments, 120),
        if arguments.chars().count() > 120 { "..." } else { "" }
    );
    trace!("[tool] {name} arguments: {arguments}");
}

fn preview(s: &str, chars: usize) -> String {
    s.chars().take(chars).collect()
}

/// Truncate to at most `max` bytes on a char boundary, appending a notice.
pub fn truncate_result(s: String, max: usize) -> String {
    if s.len() <= max {
        return s;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let head = s.get(..cut).unwrap_or_default();
    format!("{head}...\n[truncated: {} bytes total]", s.len())
}

// ── Think ──────────────────────────────────────────────────────────

/// A scratchpad tool: the reasoning is echoed back unchanged.
pub struct ThinkTool;

/// Typed arguments for the `think` tool.
#[derive(Deserialize, JsonSchema)]
pub struct ThinkArgs {
    /// Your step-by-step reasoning or analysis.
    pub reasoning: String,
}

impl Tool for ThinkTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "think",
            "Use this tool to think through a problem step-by-step before \
             acting. Write your reasoning as the 'reasoning' argument. It does \
             not perform any action.",
            crate::json_schema_for::<ThinkArgs>(),
        )
        .with_category("reasoning")
        .read_only()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        let reasoning = serde_json::from_str::<ThinkArgs>(arguments)
            .map(|a| a.reasoning)
            .unwrap_or_else(|_| "[no reasoning provided]".into());
        Box::pin(async move { Ok(ToolResult::ok(reasoning)) })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json_schema_for;

    struct EchoTool;

    impl Tool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new(
                "echo",
                "Echo the input",
                serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            )
        }

        fn execute(&self, arguments: &str) -> ToolFuture<'_> {
            let args: serde_json::Value = serde_json::from_str(arguments).unwrap_or_default();
            let text = args["text"].as_str().unwrap_or_default().to_string();
            Box::pin(async move { Ok(ToolResult::ok(text)) })
        }
    }

    struct SlowTool;

    impl Tool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("slow", "Sleeps", serde_json::json!({"type": "object"}))
        }

        fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ToolResult::ok("late"))
            })
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn add_tool() -> FnTool {
        FnTool::new(
            ToolDefinition::new("add", "Add two integers", json_schema_for::<AddArgs>()),
            |args: AddArgs| async move { Ok((args.a + args.b).to_string()) },
        )
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::new("c1", name, args)
    }

    #[test]
    fn definitions_are_sorted_and_schemas_match() {
        let set = ToolSet::new().with(EchoTool).with(ThinkTool).with(add_tool());
        let names: Vec<String> = set.definitions().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["add", "echo", "think"]);
        assert_eq!(set.schemas()[0].function.name, "add");
    }

    #[tokio::test]
    async fn execute_known_tool() {
        let set = ToolSet::new().with(EchoTool);
        let result = set.execute(&call("echo", r#"{"text": "hello"}"#)).await.unwrap();
        assert_eq!(result, ToolResult::ok("hello"));
    }

    #[tokio::test]
    async fn unknown_tool_is_recoverable() {
        let set = ToolSet::new().with(EchoTool);
        let err = set.execute(&call("nope", "{}")).await.unwrap_err();
        assert!(matches!(err, ToolError::Unavailable { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn empty_output_is_replaced() {
        let set = ToolSet::new().with(EchoTool);
        let result = set.execute(&call("echo", r#"{"text": ""}"#)).await.unwrap();
        assert_eq!(result.output, EMPTY_OUTPUT);
    }

    #[tokio::test]
    async fn fn_tool_parses_typed_args() {
        let set = ToolSet::new().with(add_tool());
        let result = set.execute(&call("add", r#"{"a": 1, "b": 2}"#)).await.unwrap();
        assert_eq!(result.output, "3");

        let err = set.execute(&call("add", r#"{"a": "x"}"#)).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn validation_rejects_missing_required() {
        let set = ToolSet::new().with_arg_validation(true).with(EchoTool);
        let err = set.execute(&call("echo", "{}")).await.unwrap_err();
        match err {
            ToolError::InvalidArguments { tool, reason } => {
                assert_eq!(tool, "echo");
                assert!(reason.contains("text"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_becomes_recoverable_error() {
        let set = ToolSet::new()
            .with_default_timeout(Some(Duration::from_millis(50)))
            .with(SlowTool);
        let err = set.execute(&call("slow", "{}")).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn long_results_are_truncated() {
        let set = ToolSet::new().with_max_result_bytes(10).with(EchoTool);
        let text = "a".repeat(40);
        let result = set
            .execute(&call("echo", &format!(r#"{{"text": "{text}"}}"#)))
            .await
            .unwrap();
        assert!(result.output.starts_with("aaaaaaaaaa..."));
        assert!(result.output.contains("[truncated: 40 bytes total]"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "é".repeat(10);
        let out = truncate_result(s, 5);
        assert!(out.starts_with("éé..."));
    }

    #[test]
    fn confirmation_policy_by_flag_and_category() {
        struct Shell;
        impl Tool for Shell {
            fn definition(&self) -> ToolDefinition {
                ToolDefinition::new("shell", "Run a command", serde_json::json!({"type": "object"}))
                    .with_category("exec")
            }
            fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
                Box::pin(async { Ok(ToolResult::ok("")) })
            }
        }

        let set = ToolSet::new().with(Shell).with(ThinkTool);
        assert!(!set.requires_confirmation("shell"));

        let set = ToolSet::new()
            .with_confirmation_category("exec")
            .with_confirmation_category("reasoning")
            .with(Shell)
            .with(ThinkTool);
        assert!(set.requires_confirmation("shell"));
        // Read-only wins over category policy.
        assert!(!set.requires_confirmation("think"));
        assert!(!set.requires_confirmation("missing"));
    }

    #[tokio::test]
    async fn think_echoes_reasoning() {
        let result = ThinkTool.execute(r#"{"reasoning": "step 1"}"#).await.unwrap();
        assert_eq!(result.output, "step 1");
    }

    #[test]
    fn tool_error_to_result() {
        let err = ToolError::Execution {
            tool: "add".into(),
            reason: "overflow".into(),
        };
        let result = ToolResult::from(&err);
        assert!(result.is_error);
        assert_eq!(result.output, "Error: tool 'add' failed: overflow");
    }
}

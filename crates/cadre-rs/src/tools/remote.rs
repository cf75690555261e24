//! Tools served by a remote process.
//!
//! A [`RemoteTransport`] carries a [`RemoteRequest`] envelope to a tool
//! server and returns a [`RemoteResponse`]. Application errors reported by
//! the server are ordinary error results; a broken transport aborts the run.

use super::core::{Tool, ToolDefinition, ToolFuture, ToolResult, ToolSet};
use crate::error::{ToolError, TransportError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Boxed future returned by [`RemoteTransport`] methods.
pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// Category assigned to discovered tools.
pub const REMOTE_CATEGORY: &str = "remote";

/// A call sent to a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRequest {
    pub tool: String,
    pub arguments: serde_json::Value,
}

/// A tool server's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RemoteResponse {
    Ok {
        #[serde(default)]
        content: serde_json::Value,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i64>,
    },
}

impl RemoteResponse {
    /// Text recorded in the session for this reply. String content is used
    /// verbatim; structured content is serialized.
    pub fn into_result(self) -> ToolResult {
        match self {
            RemoteResponse::Ok { content } => ToolResult::ok(render_content(content)),
            RemoteResponse::Error { message, code } => match code {
                Some(code) => ToolResult::error(format!("Error ({code}): {message}")),
                None => ToolResult::error(format!("Error: {message}")),
            },
        }
    }
}

fn render_content(content: serde_json::Value) -> String {
    match content {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One entry in a tool server's catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub read_only: bool,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl RemoteToolInfo {
    pub fn definition(&self) -> ToolDefinition {
        let mut def = ToolDefinition::new(&self.name, &self.description, self.parameters.clone())
            .with_category(REMOTE_CATEGORY);
        def.requires_confirmation = self.requires_confirmation;
        def.read_only = self.read_only;
        def
    }
}

/// A channel to a tool server.
pub trait RemoteTransport: Send + Sync {
    fn call(&self, request: RemoteRequest) -> TransportFuture<'_, RemoteResponse>;

    fn list_tools(&self) -> TransportFuture<'_, Vec<RemoteToolInfo>>;
}

// ── RemoteTool ─────────────────────────────────────────────────────

/// Proxy for one remote tool.
pub struct RemoteTool {
    info: RemoteToolInfo,
    transport: Arc<dyn RemoteTransport>,
}

impl RemoteTool {
    pub fn new(info: RemoteToolInfo, transport: Arc<dyn RemoteTransport>) -> Self {
        Self { info, transport }
    }

    async fn invoke(&self, arguments: String) -> Result<ToolResult, ToolError> {
        let raw = if arguments.trim().is_empty() { "{}" } else { arguments.as_str() };
        let arguments: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
                tool: self.info.name.clone(),
                reason: format!("invalid JSON: {e}"),
            })?;
        let request = RemoteRequest {
            tool: self.info.name.clone(),
            arguments,
        };
        match self.transport.call(request).await {
            Ok(response) => {
                if let RemoteResponse::Error { message, .. } = &response {
                    debug!("Remote tool {} reported error: {message}", self.info.name);
                }
                Ok(response.into_result())
            }
            Err(source) => {
                warn!("Transport failure calling remote tool {}: {source}", self.info.name);
                Err(ToolError::Transport {
                    tool: self.info.name.clone(),
                    source,
                })
            }
        }
    }
}

impl Tool for RemoteTool {
    fn definition(&self) -> ToolDefinition {
        self.info.definition()
    }

    fn execute(&self, arguments: &str) -> ToolFuture<'_> {
        Box::pin(self.invoke(arguments.to_string()))
    }

    fn name(&self) -> String {
        self.info.name.clone()
    }
}

// ── RemoteToolset ──────────────────────────────────────────────────

/// The catalog of a tool server, ready to register into a [`ToolSet`].
pub struct RemoteToolset {
    transport: Arc<dyn RemoteTransport>,
    catalog: Vec<RemoteToolInfo>,
}

impl RemoteToolset {
    /// Fetch the server's catalog.
    pub async fn discover(transport: Arc<dyn RemoteTransport>) -> Result<Self, TransportError> {
        let catalog = transport.list_tools().await?;
        info!(
            "Discovered {} remote tool(s): {}",
            catalog.len(),
            catalog
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self { transport, catalog })
    }

    pub fn catalog(&self) -> &[RemoteToolInfo] {
        &self.catalog
    }

    pub fn into_tools(self) -> Vec<RemoteTool> {
        let transport = self.transport;
        self.catalog
            .into_iter()
            .map(|info| RemoteTool::new(info, Arc::clone(&transport)))
            .collect()
    }

    pub fn register_into(self, tools: &mut ToolSet) {
        for tool in self.into_tools() {
            tools.register(tool);
        }
    }
}

impl ToolSet {
    /// Register every tool of a discovered remote catalog.
    pub fn with_remote(mut self, toolset: RemoteToolset) -> Self {
        toolset.register_into(&mut self);
        self
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ToolCall;
    use std::sync::Mutex;

    /// In-memory transport: `upper` uppercases, `fail` reports an error and
    /// anything else breaks the connection.
    #[derive(Default)]
    pub(crate) struct MemoryTransport {
        pub(crate) calls: Mutex<Vec<RemoteRequest>>,
    }

    impl RemoteTransport for MemoryTransport {
        fn call(&self, request: RemoteRequest) -> TransportFuture<'_, RemoteResponse> {
            self.calls.lock().unwrap().push(request.clone());
            Box::pin(async move {
                match request.tool.as_str() {
                    "upper" => Ok(RemoteResponse::Ok {
                        content: request.arguments["text"]
                            .as_str()
                            .unwrap_or_default()
                            .to_uppercase()
                            .into(),
                    }),
                    "fail" => Ok(RemoteResponse::Error {
                        message: "bad input".into(),
                        code: Some(400),
                    }),
                    _ => Err(TransportError::Closed),
                }
            })
        }

        fn list_tools(&self) -> TransportFuture<'_, Vec<RemoteToolInfo>> {
            Box::pin(async {
                Ok(vec![
                    RemoteToolInfo {
                        name: "upper".into(),
                        description: "Uppercase text".into(),
                        parameters: empty_object_schema(),
                        requires_confirmation: false,
                        read_only: true,
                    },
                    RemoteToolInfo {
                        name: "fail".into(),
                        description: "Always fails".into(),
                        parameters: empty_object_schema(),
                        requires_confirmation: true,
                        read_only: false,
                    },
                    RemoteToolInfo {
                        name: "gone".into(),
                        description: "Server vanished".into(),
                        parameters: empty_object_schema(),
                        requires_confirmation: false,
                        read_only: false,
                    },
                ])
            })
        }
    }

    async fn toolset() -> ToolSet {
        let transport: Arc<dyn RemoteTransport> = Arc::new(MemoryTransport::default());
        let remote = RemoteToolset::discover(transport).await.unwrap();
        ToolSet::new().with_remote(remote)
    }

    #[tokio::test]
    async fn discovery_registers_catalog() {
        let tools = toolset().await;
        assert_eq!(tools.len(), 3);
        assert!(tools.requires_confirmation("fail"));
        assert!(tools.is_read_only("upper"));
        assert_eq!(tools.definitions()[0].category, REMOTE_CATEGORY);
    }

    #[tokio::test]
    async fn ok_response_becomes_output() {
        let tools = toolset().await;
        let result = tools
            .execute(&ToolCall::new("c1", "upper", r#"{"text": "abc"}"#))
            .await
            .unwrap();
        assert_eq!(result, ToolResult::ok("ABC"));
    }

    #[tokio::test]
    async fn application_error_is_error_result() {
        let tools = toolset().await;
        let result = tools.execute(&ToolCall::new("c1", "fail", "{}")).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.output, "Error (400): bad input");
    }

    #[tokio::test]
    async fn transport_failure_is_unrecoverable() {
        let tools = toolset().await;
        let err = tools.execute(&ToolCall::new("c1", "gone", "{}")).await.unwrap_err();
        assert!(matches!(err, ToolError::Transport { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn envelope_wire_shape() {
        let ok: RemoteResponse =
            serde_json::from_str(r#"{"status": "ok", "content": {"n": 1}}"#).unwrap();
        assert_eq!(ok.into_result().output, r#"{"n":1}"#);

        let err: RemoteResponse =
            serde_json::from_str(r#"{"status": "error", "message": "nope"}"#).unwrap();
        assert_eq!(err.into_result(), ToolResult::error("Error: nope"));
    }
}

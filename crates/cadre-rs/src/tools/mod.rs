//! Tools the model can call.
//!
//! - [`core`]: the [`Tool`] trait, [`ToolSet`] registry, [`FnTool`] and
//!   [`ThinkTool`]
//! - [`remote`] and [`transport`]: tools served by another process
//! - [`permissions`]: team-level allow/deny patterns
//! - [`transfer`]: the `transfer_task` delegation schema

pub mod core;
pub mod permissions;
pub mod remote;
pub mod transfer;
pub mod transport;

pub use self::core::{
    DEFAULT_MAX_RESULT_BYTES, EMPTY_OUTPUT, FnTool, ThinkArgs, ThinkTool, Tool, ToolDefinition,
    ToolFuture, ToolResult, ToolSet, log_tool_call, parse_tool_args, truncate_result,
    validate_tool_arguments,
};
pub use permissions::{PermissionDecision, Permissions, PermissionsConfig};
pub use remote::{
    RemoteRequest, RemoteResponse, RemoteTool, RemoteToolInfo, RemoteToolset, RemoteTransport,
    TransportFuture,
};
pub use transfer::{TRANSFER_TASK, TransferTaskArgs, member_task_prompt, transfer_task_definition};
pub use transport::{HttpTransport, StdioTransport};

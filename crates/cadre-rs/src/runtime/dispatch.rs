//! Per-call routing: what the turn loop should do with one tool call, and
//! executing the ones that can run.

use crate::ToolCall;
use crate::agent::{Agent, Team};
use crate::error::{Result, RuntimeError, ToolError};
use crate::session::Session;
use crate::tools::{PermissionDecision, Permissions, TRANSFER_TASK, ToolResult, ToolSet};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a tool call is handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// A `transfer_task` call from an agent with sub-agents.
    Delegate,
    /// Answered without executing anything.
    Respond(ToolResult),
    /// Suspend the run until the caller decides.
    NeedsConfirmation,
    /// Execute now.
    Ready,
}

/// Decide how `agent` handles `call`.
///
/// Checks run in order: delegation, availability, session permission
/// patterns, team permission patterns, then the tool's confirmation policy
/// against standing approvals.
pub(crate) fn classify(
    agent: &Agent,
    team: &Team,
    session: &Session,
    approvals: &BTreeSet<String>,
    call: &ToolCall,
) -> Disposition {
    let name = call.name();
    if name == TRANSFER_TASK && agent.has_sub_agents() {
        return Disposition::Delegate;
    }
    if !agent.tools.contains(name) {
        debug!("Agent {} called unavailable tool {name}", agent.name);
        let err = ToolError::Unavailable {
            tool: name.to_string(),
            agent: agent.name.clone(),
        };
        return Disposition::Respond(ToolResult::error(err.to_string()));
    }

    if let Some(config) = session.permissions() {
        match Permissions::compile(&config) {
            Ok(perms) => match perms.check_call(name, call.arguments()) {
                PermissionDecision::Deny => {
                    debug!("Tool {name} denied by session permissions");
                    return Disposition::Respond(ToolResult::error(format!(
                        "Tool '{name}' is denied by session permissions."
                    )));
                }
                PermissionDecision::Allow => return Disposition::Ready,
                PermissionDecision::Ask => {}
            },
            Err(err) => warn!("Ignoring session permissions: {err}"),
        }
    }

    match team.permissions().check_call(name, call.arguments()) {
        PermissionDecision::Deny => {
            return Disposition::Respond(ToolResult::error(format!(
                "Tool '{name}' is denied by permissions configuration."
            )));
        }
        PermissionDecision::Allow => return Disposition::Ready,
        PermissionDecision::Ask => {}
    }

    let approved = !agent.tools.requires_confirmation(name)
        || session.tools_approved()
        || approvals.contains(name)
        || session.is_tool_approved(name);
    if approved {
        Disposition::Ready
    } else {
        Disposition::NeedsConfirmation
    }
}

/// Execute one call through `tools`.
///
/// Recoverable tool errors become error results. A transport failure or
/// cancellation ends the run.
pub(crate) async fn execute(
    tools: &ToolSet,
    call: &ToolCall,
    token: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<ToolResult> {
    let run = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, tools.execute(call))
                .await
                .unwrap_or_else(|_| {
                    Err(ToolError::Timeout {
                        tool: call.name().to_string(),
                        after: limit,
                    })
                }),
            None => tools.execute(call).await,
        }
    };

    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(RuntimeError::Cancelled),
        outcome = run => outcome,
    };

    match outcome {
        Ok(result) => Ok(result),
        Err(ToolError::Transport { tool, source }) => {
            warn!("Remote tool {tool} unreachable: {source}");
            Err(RuntimeError::Transport { tool, source })
        }
        Err(err) => {
            debug!("Tool {} failed: {err}", call.name());
            Ok(ToolResult::from(&err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::provider::ScriptedProvider;
    use crate::tools::{FnTool, PermissionsConfig, Tool, ToolDefinition, ToolFuture};
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Deserialize)]
    struct Empty {}

    fn tool(name: &str, confirm: bool) -> FnTool {
        let mut def = ToolDefinition::new(name, "test tool", serde_json::json!({"type": "object"}));
        if confirm {
            def = def.requiring_confirmation();
        }
        FnTool::new(def, |_: Empty| async { Ok("done".to_string()) })
    }

    fn agent(tools: ToolSet) -> Agent {
        Agent::new("root", Arc::new(ScriptedProvider::new("m"))).with_tools(tools)
    }

    #[test]
    fn classification_order() {
        let root = agent(ToolSet::new().with(tool("read", false)).with(tool("shell", true)));
        let team = Team::single(root.clone());
        let session = Session::new();
        let none = BTreeSet::new();
        let check = |name: &str| {
            classify(&root, &team, &session, &none, &ToolCall::new("c", name, "{}"))
        };

        assert_eq!(check("read"), Disposition::Ready);
        assert_eq!(check("shell"), Disposition::NeedsConfirmation);
        assert_eq!(
            check("rm"),
            Disposition::Respond(ToolResult::error(
                "Tool 'rm' is not available to this agent (root)."
            ))
        );
        // No sub-agents: transfer_task is just an unknown tool.
        assert!(matches!(check(TRANSFER_TASK), Disposition::Respond(_)));
    }

    #[test]
    fn standing_approvals_skip_confirmation() {
        let root = agent(ToolSet::new().with(tool("shell", true)));
        let team = Team::single(root.clone());
        let call = ToolCall::new("c", "shell", "{}");

        let session = Session::new();
        let mut approvals = BTreeSet::new();
        approvals.insert("shell".to_string());
        assert_eq!(classify(&root, &team, &session, &approvals, &call), Disposition::Ready);

        let none = BTreeSet::new();
        session.approve_tool("shell");
        assert_eq!(classify(&root, &team, &session, &none, &call), Disposition::Ready);

        let session = Session::new();
        session.set_tools_approved(true);
        assert_eq!(classify(&root, &team, &session, &none, &call), Disposition::Ready);
    }

    #[test]
    fn permissions_override_confirmation_policy() {
        let root = agent(ToolSet::new().with(tool("shell", true)).with(tool("read", false)));
        let team = Team::single(root.clone())
            .with_permissions(&PermissionsConfig::default().allow("shell").deny("read"))
            .unwrap();
        let session = Session::new();
        let none = BTreeSet::new();

        let shell = ToolCall::new("c", "shell", "{}");
        assert_eq!(classify(&root, &team, &session, &none, &shell), Disposition::Ready);
        let read = ToolCall::new("c", "read", "{}");
        assert_eq!(
            classify(&root, &team, &session, &none, &read),
            Disposition::Respond(ToolResult::error(
                "Tool 'read' is denied by permissions configuration."
            ))
        );
    }

    #[test]
    fn session_permissions_are_checked_before_team() {
        let root = agent(ToolSet::new().with(tool("shell", true)).with(tool("read", false)));
        let team = Team::single(root.clone())
            .with_permissions(&PermissionsConfig::default().deny("shell").allow("read"))
            .unwrap();
        let session = Session::new();
        session
            .set_permissions(PermissionsConfig::default().allow("shell").deny("read"))
            .unwrap();
        let none = BTreeSet::new();

        let shell = ToolCall::new("c", "shell", "{}");
        assert_eq!(classify(&root, &team, &session, &none, &shell), Disposition::Ready);
        let read = ToolCall::new("c", "read", "{}");
        assert_eq!(
            classify(&root, &team, &session, &none, &read),
            Disposition::Respond(ToolResult::error(
                "Tool 'read' is denied by session permissions."
            ))
        );

        // No session match: the team's patterns decide.
        session
            .set_permissions(PermissionsConfig::default().allow("other"))
            .unwrap();
        assert_eq!(
            classify(&root, &team, &session, &none, &shell),
            Disposition::Respond(ToolResult::error(
                "Tool 'shell' is denied by permissions configuration."
            ))
        );
    }

    struct Unreachable;

    impl Tool for Unreachable {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("remote", "always fails", serde_json::json!({"type": "object"}))
        }

        fn execute(&self, _arguments: &str) -> ToolFuture<'_> {
            Box::pin(async {
                Err(ToolError::Transport {
                    tool: "remote".into(),
                    source: TransportError::Closed,
                })
            })
        }
    }

    #[tokio::test]
    async fn execution_error_mapping() {
        let failing = FnTool::new(
            ToolDefinition::new("fail", "fails", serde_json::json!({"type": "object"})),
            |_: Empty| async { Err("disk full".to_string()) },
        );
        let tools = ToolSet::new().with(failing).with(Unreachable);
        let token = CancellationToken::new();

        let result = execute(&tools, &ToolCall::new("c", "fail", "{}"), &token, None)
            .await
            .unwrap();
        assert!(result.is_error);
        assert_eq!(result.output, "Error: tool 'fail' failed: disk full");

        let fatal = execute(&tools, &ToolCall::new("c", "remote", "{}"), &token, None).await;
        assert!(matches!(fatal, Err(RuntimeError::Transport { .. })));
    }

    #[tokio::test]
    async fn cancelled_token_stops_execution() {
        let tools = ToolSet::new().with(tool("read", false));
        let token = CancellationToken::new();
        token.cancel();
        let result = execute(&tools, &ToolCall::new("c", "read", "{}"), &token, None).await;
        assert!(matches!(result, Err(RuntimeError::Cancelled)));
    }

    #[tokio::test]
    async fn runtime_timeout_is_recoverable() {
        let slow = FnTool::new(
            ToolDefinition::new("slow", "sleeps", serde_json::json!({"type": "object"})),
            |_: Empty| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("late".to_string())
            },
        );
        let tools = ToolSet::new().with(slow);
        let token = CancellationToken::new();
        let result = execute(
            &tools,
            &ToolCall::new("c", "slow", "{}"),
            &token,
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap();
        assert!(result.is_error);
        assert!(result.output.contains("timed out"));
    }
}

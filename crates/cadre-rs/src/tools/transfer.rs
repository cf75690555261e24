//! The `transfer_task` delegation tool.
//!
//! `transfer_task` is never executed through a [`ToolSet`](super::ToolSet);
//! the runtime intercepts it and pushes a frame for the target agent. This
//! module only owns its schema, argument type and the task prompt handed to
//! the delegate.

use super::core::ToolDefinition;
use crate::error::ToolError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const TRANSFER_TASK: &str = "transfer_task";

/// Arguments of a `transfer_task` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TransferTaskArgs {
    /// The name of the agent to transfer the task to.
    pub agent: String,
    /// A clear and concise description of the task the member should achieve.
    pub task: String,
    /// The expected output from the member (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
}

impl TransferTaskArgs {
    pub fn parse(arguments: &str) -> Result<Self, ToolError> {
        super::core::parse_tool_args(TRANSFER_TASK, arguments)
    }
}

pub fn transfer_task_definition() -> ToolDefinition {
    ToolDefinition::new(
        TRANSFER_TASK,
        "Use this function to transfer a task to the selected team member. \
         You must provide a clear and concise description of the task the \
         member should achieve AND the expected output.",
        crate::json_schema_for::<TransferTaskArgs>(),
    )
    .with_category("delegation")
}

/// The user message that opens a delegated frame.
pub fn member_task_prompt(args: &TransferTaskArgs) -> String {
    let mut prompt = format!(
        "You are a member of a team of agents. Your goal is to complete the following task:\
         \n\n<task>\n{}\n</task>",
        args.task
    );
    if let Some(expected) = args.expected_output.as_deref().filter(|e| !e.trim().is_empty()) {
        prompt.push_str(&format!("\n\n<expected_output>\n{expected}\n</expected_output>"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_requires_agent_and_task() {
        let def = transfer_task_definition();
        assert_eq!(def.name, TRANSFER_TASK);
        let required = def.parameters["required"].as_array().unwrap();
        assert!(required.contains(&"agent".into()));
        assert!(required.contains(&"task".into()));
        assert!(!required.contains(&"expected_output".into()));
    }

    #[test]
    fn prompt_with_and_without_expected_output() {
        let mut args = TransferTaskArgs {
            agent: "researcher".into(),
            task: "Find the capital of France".into(),
            expected_output: None,
        };
        assert_eq!(
            member_task_prompt(&args),
            "You are a member of a team of agents. Your goal is to complete the following task:\
             \n\n<task>\nFind the capital of France\n</task>"
        );

        args.expected_output = Some("A city name".into());
        assert!(
            member_task_prompt(&args).ends_with("\n\n<expected_output>\nA city name\n</expected_output>")
        );
    }

    #[test]
    fn parse_rejects_missing_task() {
        let err = TransferTaskArgs::parse(r#"{"agent": "x"}"#).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}

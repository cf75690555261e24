//! Formatting an agent's view of the session into a model request.
//!
//! The request is laid out as:
//!
//! 1. a multi-agent preamble listing sub-agents (only when the agent has any)
//! 2. the agent's instruction, plus today's date when `add_date` is set
//! 3. one system message per tool that ships instructions
//! 4. the frame's history, trimmed to `num_history_items`

use super::{Agent, Team};
use crate::provider::CompletionRequest;
use crate::tools::transfer_task_definition;
use crate::{Message, MessageRole};
use std::collections::BTreeSet;
use tracing::trace;

/// Build the request for one model call by `agent`.
pub fn build_request(agent: &Agent, team: &Team, history: Vec<Message>) -> CompletionRequest {
    let mut messages = Vec::new();

    if agent.has_sub_agents() {
        messages.push(Message::system(multi_agent_preamble(agent, team)));
    }

    let mut instruction = agent.instruction.clone();
    if agent.add_date {
        instruction.push_str(&format!(
            "\n\nDate today is: {}",
            chrono::Utc::now().format("%Y-%m-%d")
        ));
    }
    if !instruction.trim().is_empty() {
        messages.push(Message::system(instruction));
    }

    messages.extend(agent.tools.instructions().into_iter().map(Message::system));

    let total = history.len();
    let history = match agent.num_history_items {
        Some(limit) => trim_history(history, limit),
        None => history,
    };
    trace!(
        "Request for {}: {} prompt message(s), {}/{} history message(s)",
        agent.name,
        messages.len(),
        history.len(),
        total
    );
    messages.extend(history);

    let mut tools = agent.tools.schemas();
    if agent.has_sub_agents() {
        tools.push(transfer_task_definition().to_tool_def());
    }

    CompletionRequest {
        model: agent.model.model_id().to_string(),
        messages,
        tools,
    }
}

fn multi_agent_preamble(agent: &Agent, team: &Team) -> String {
    let roster: String = agent
        .sub_agents
        .iter()
        .filter_map(|name| team.get(name))
        .map(|sub| format!("{}: {}\n", sub.name, sub.description))
        .collect();
    format!(
        "You are a multi-agent system, make sure to answer the user query in the most \
         helpful way possible. You have access to these sub-agents:\n{roster}\n\
         If you are the best to answer the question according to your description, \
         you can answer it.\n\n\
         If another agent is better for answering the question according to its \
         description, call the `transfer_task` function to hand the task to that \
         agent. When transferring, do not generate any text other than the function call."
    )
}

/// Keep system messages and the last `limit` other messages.
///
/// Tool responses whose assistant call was trimmed away are dropped too, so
/// the result never contains an orphaned tool message.
pub fn trim_history(messages: Vec<Message>, limit: usize) -> Vec<Message> {
    let conversational = messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .count();
    if conversational <= limit {
        return messages;
    }

    let mut to_drop = conversational - limit;
    let mut dropped_calls = BTreeSet::new();
    let mut kept = Vec::with_capacity(messages.len() - to_drop);
    for message in messages {
        if message.role == MessageRole::System {
            kept.push(message);
        } else if to_drop > 0 {
            to_drop -= 1;
            dropped_calls.extend(message.calls().iter().map(|c| c.id.clone()));
        } else if message.role == MessageRole::Tool
            && message
                .tool_call_id
                .as_ref()
                .is_some_and(|id| dropped_calls.contains(id))
        {
            continue;
        } else {
            kept.push(message);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::provider::ScriptedProvider;
    use crate::tools::{TRANSFER_TASK, ThinkTool, ToolSet};
    use std::sync::Arc;

    fn model() -> Arc<ScriptedProvider> {
        Arc::new(ScriptedProvider::new("test-model"))
    }

    #[test]
    fn single_agent_request() {
        let agent = Agent::new("root", model())
            .with_instruction("Be brief.")
            .with_tools(ToolSet::new().with(ThinkTool));
        let team = Team::single(agent.clone());
        let request = build_request(&agent, &team, vec![Message::user("hi")]);

        assert_eq!(request.model, "test-model");
        assert_eq!(request.messages[0], Message::system("Be brief."));
        assert_eq!(request.messages[1], Message::user("hi"));
        assert_eq!(request.tools.len(), 1);
        assert_eq!(request.tools[0].function.name, "think");
    }

    #[test]
    fn sub_agents_add_preamble_and_transfer_tool() {
        let root = Agent::new("root", model())
            .with_instruction("Coordinate.")
            .with_sub_agents(["researcher"]);
        let researcher = Agent::new("researcher", model()).with_description("Finds facts");
        let team = Team::new("root", vec![root.clone(), researcher]).unwrap();

        let request = build_request(&root, &team, vec![]);
        let preamble = request.messages[0].text();
        assert!(preamble.starts_with("You are a multi-agent system"));
        assert!(preamble.contains("researcher: Finds facts\n"));
        assert_eq!(request.messages[1].text(), "Coordinate.");
        assert!(request.tools.iter().any(|t| t.function.name == TRANSFER_TASK));
    }

    #[test]
    fn date_is_appended() {
        let agent = Agent::new("root", model())
            .with_instruction("Hi.")
            .with_date(true);
        let team = Team::single(agent.clone());
        let request = build_request(&agent, &team, vec![]);
        assert!(request.messages[0].text().contains("Date today is: "));
    }

    #[test]
    fn trim_keeps_tool_pairs_consistent() {
        let messages = vec![
            Message::system("sys"),
            Message::user("q1"),
            Message::assistant(None, vec![ToolCall::new("a", "think", "{}")]),
            Message::tool_result("a", "thought"),
            Message::assistant_text("answer 1"),
            Message::user("q2"),
        ];
        // Five conversational messages, keep three: the assistant call is
        // dropped so its tool response goes too.
        let trimmed = trim_history(messages, 3);
        let roles: Vec<_> = trimmed.iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![MessageRole::System, MessageRole::Assistant, MessageRole::User]
        );
        assert_eq!(trimmed[1].text(), "answer 1");
    }

    #[test]
    fn trim_under_limit_is_identity() {
        let messages = vec![Message::user("a"), Message::assistant_text("b")];
        assert_eq!(trim_history(messages.clone(), 10), messages);
    }

    #[test]
    fn history_limit_applies_to_request() {
        let agent = Agent::new("root", model()).with_history_limit(1);
        let team = Team::single(agent.clone());
        let request = build_request(
            &agent,
            &team,
            vec![Message::user("old"), Message::assistant_text("x"), Message::user("new")],
        );
        assert_eq!(request.messages, vec![Message::user("new")]);
    }
}

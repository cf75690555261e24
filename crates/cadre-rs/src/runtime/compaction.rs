//! Summarizing the root agent's history when the context window fills up.
//!
//! Compaction is opt-in ([`RuntimeConfig::session_compaction`]). Before a
//! root model turn, if the previous call used more than the configured
//! fraction of the context window, the root frame's history is summarized
//! through the agent's own model and a summary entry is recorded. Later
//! requests for the frame start at that entry; the session keeps every
//! message.

use super::config::RuntimeConfig;
use super::events::EventSink;
use super::machine::ActiveRun;
use crate::agent::Agent;
use crate::error::{ProviderError, Result, RuntimeError};
use crate::provider::CompletionRequest;
use crate::session::{ROOT_FRAME, Usage};
use crate::usage::measure_call;
use crate::{Message, MessageRole};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

const SUMMARY_SYSTEM_PROMPT: &str = "You are a helpful AI assistant that creates comprehensive \
    summaries of conversations. You will be given a conversation history and asked to create a \
    concise yet thorough summary that captures the key points, decisions made, and outcomes.";

const SUMMARY_INSTRUCTIONS: &str = "Based on the following conversation between a user and an \
    AI assistant, create a comprehensive summary that captures:\n\
    - The main topics discussed\n\
    - Key information exchanged\n\
    - Decisions made or conclusions reached\n\
    - Important outcomes or results\n\n\
    Provide a well-structured summary (2-4 paragraphs) that someone could read to understand \
    what happened in this conversation. Return ONLY the summary text, nothing else.";

/// Whether the last call's context use calls for a summary.
pub(crate) fn needs_compaction(config: &RuntimeConfig, usage: &Usage) -> bool {
    config.session_compaction && usage.context_fraction() > config.compaction_threshold
}

/// Plain-text transcript of `messages`, one line per message.
fn transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.role {
            MessageRole::System => continue,
            MessageRole::User => "User",
            MessageRole::Assistant => "Assistant",
            MessageRole::Tool => "Tool",
        };
        let _ = write!(out, "\n{role}: {}", message.text());
        for call in message.calls() {
            let _ = write!(out, " [called {}({})]", call.name(), call.arguments());
        }
    }
    out
}

fn summary_request(model: &str, messages: &[Message]) -> CompletionRequest {
    let prompt = format!(
        "{SUMMARY_INSTRUCTIONS}\n\nConversation history:{}\n\n\
         Generate a summary for this conversation:",
        transcript(messages)
    );
    CompletionRequest {
        model: model.to_string(),
        messages: vec![Message::system(SUMMARY_SYSTEM_PROMPT), Message::user(prompt)],
        tools: Vec::new(),
    }
}

impl ActiveRun {
    /// Summarize the root frame when the context window is nearly full.
    ///
    /// A failed summary is logged and skipped; only cancellation is fatal.
    pub(super) async fn compact_if_needed(&mut self, agent: &Agent, sink: &EventSink) -> Result<()> {
        if !needs_compaction(&self.config, &self.session().usage()) {
            return Ok(());
        }
        let history = self.session().frame_history(ROOT_FRAME);
        if history.iter().all(|m| m.role == MessageRole::System) {
            return Ok(());
        }

        info!(
            "[{}] compacting history for {}: {} message(s), {:.0}% of context used",
            self.run_id,
            agent.name,
            history.len(),
            self.session().usage().context_fraction() * 100.0
        );
        let request = summary_request(agent.model.model_id(), &history);
        let summarize = async {
            match self.config.model_timeout {
                Some(limit) => tokio::time::timeout(limit, agent.model.complete(&request))
                    .await
                    .unwrap_or(Err(ProviderError::Timeout(limit))),
                None => agent.model.complete(&request).await,
            }
        };
        let outcome = tokio::select! {
            biased;
            _ = sink.token().cancelled() => return Err(RuntimeError::Cancelled),
            outcome = summarize => outcome,
        };

        let completion = match outcome {
            Ok(completion) => completion,
            Err(err) => {
                warn!("[{}] failed to summarize history: {err}", self.run_id);
                return Ok(());
            }
        };
        self.session().record_usage(measure_call(
            agent.model.model_id(),
            agent.model.context_limit(),
            &request,
            &completion,
        ));

        let summary = completion.content.unwrap_or_default();
        let summary = summary.trim();
        if summary.is_empty() {
            debug!("[{}] model returned an empty summary", self.run_id);
            return Ok(());
        }
        self.session().record_summary(summary, &agent.name, ROOT_FRAME);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;

    #[test]
    fn threshold_is_opt_in() {
        let usage = Usage {
            context_length: 95,
            context_limit: 100,
            ..Default::default()
        };
        assert!(!needs_compaction(&RuntimeConfig::default(), &usage));

        let config = RuntimeConfig::default().with_session_compaction(true);
        assert!(needs_compaction(&config, &usage));
        assert!(!needs_compaction(&config, &Usage::default()));
        assert!(!needs_compaction(&config.with_compaction_threshold(0.99), &usage));
    }

    #[test]
    fn transcript_skips_system_and_names_calls() {
        let messages = vec![
            Message::system("be nice"),
            Message::user("add 1 and 2"),
            Message::assistant(None, vec![ToolCall::new("c1", "add", r#"{"a":1,"b":2}"#)]),
            Message::tool_result("c1", "3"),
            Message::assistant(Some("3".into()), vec![]),
        ];
        assert_eq!(
            transcript(&messages),
            "\nUser: add 1 and 2\nAssistant:  [called add({\"a\":1,\"b\":2})]\nTool: 3\nAssistant: 3"
        );
        let request = summary_request("m", &messages);
        assert!(request.tools.is_empty());
        assert_eq!(request.messages[0].role, MessageRole::System);
        assert!(request.messages[1].text().contains("User: add 1 and 2"));
    }
}

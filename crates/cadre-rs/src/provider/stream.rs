//! Incremental model output and its reassembly.

use super::Completion;
use crate::{ToolCall, UsageInfo};
use std::collections::BTreeMap;
use tracing::trace;

/// One delta from a streaming model call.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An incremental text content delta.
    TextDelta(String),
    /// An incremental reasoning delta. Not part of the final content.
    ReasoningDelta(String),
    /// A tool call fragment; fragments with the same `index` are concatenated.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: String,
    },
    /// Token usage, usually sent with the final chunk.
    Usage(UsageInfo),
    /// The stream is complete.
    Done,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds [`StreamEvent`]s into a [`Completion`].
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    content: String,
    reasoning: String,
    calls: BTreeMap<usize, PartialCall>,
    usage: Option<UsageInfo>,
    done: bool,
}

impl StreamAccumulator {
    pub fn push(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => self.content.push_str(&delta),
            StreamEvent::ReasoningDelta(delta) => self.reasoning.push_str(&delta),
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments_delta,
            } => {
                let call = self.calls.entry(index).or_default();
                if let Some(id) = id {
                    call.id = Some(id);
                }
                if let Some(name) = name {
                    call.name.push_str(&name);
                }
                call.arguments.push_str(&arguments_delta);
            }
            StreamEvent::Usage(usage) => self.usage = Some(usage),
            StreamEvent::Done => self.done = true,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Finish accumulation. Calls without a provider id get a positional one;
    /// calls with empty arguments get `{}`.
    pub fn finish(self) -> Completion {
        let tool_calls: Vec<ToolCall> = self
            .calls
            .into_iter()
            .map(|(index, call)| {
                let id = call.id.unwrap_or_else(|| format!("call_{index}"));
                let arguments = if call.arguments.trim().is_empty() {
                    "{}".to_string()
                } else {
                    call.arguments
                };
                ToolCall::new(id, call.name, arguments)
            })
            .collect();
        trace!(
            "Stream assembled: {} chars text, {} tool call(s)",
            self.content.len(),
            tool_calls.len()
        );
        Completion {
            content: if self.content.is_empty() {
                None
            } else {
                Some(self.content)
            },
            tool_calls,
            usage: self.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_are_joined_by_index() {
        let mut acc = StreamAccumulator::default();
        acc.push(StreamEvent::ToolCallDelta {
            index: 1,
            id: Some("b".into()),
            name: Some("sub".into()),
            arguments_delta: r#"{"a":"#.into(),
        });
        acc.push(StreamEvent::ToolCallDelta {
            index: 0,
            id: Some("a".into()),
            name: Some("add".into()),
            arguments_delta: String::new(),
        });
        acc.push(StreamEvent::ToolCallDelta {
            index: 1,
            id: None,
            name: None,
            arguments_delta: "5}".into(),
        });
        acc.push(StreamEvent::Done);
        assert!(acc.is_done());

        let completion = acc.finish();
        assert_eq!(completion.content, None);
        let calls = completion.tool_calls;
        assert_eq!(calls[0].id, "a");
        assert_eq!(calls[0].arguments(), "{}");
        assert_eq!(calls[1].name(), "sub");
        assert_eq!(calls[1].arguments(), r#"{"a":5}"#);
    }

    #[test]
    fn text_and_reasoning_are_separate() {
        let mut acc = StreamAccumulator::default();
        acc.push(StreamEvent::ReasoningDelta("thinking".into()));
        acc.push(StreamEvent::TextDelta("The answer ".into()));
        acc.push(StreamEvent::TextDelta("is 3".into()));
        assert_eq!(acc.reasoning(), "thinking");
        assert_eq!(acc.finish().content.as_deref(), Some("The answer is 3"));
    }

    #[test]
    fn missing_id_gets_positional_id() {
        let mut acc = StreamAccumulator::default();
        acc.push(StreamEvent::ToolCallDelta {
            index: 2,
            id: None,
            name: Some("think".into()),
            arguments_delta: "{}".into(),
        });
        assert_eq!(acc.finish().tool_calls[0].id, "call_2");
    }
}

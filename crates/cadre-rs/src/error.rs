//! Error taxonomy.
//!
//! Only [`RuntimeError`] ever escapes a run. Tool-level failures
//! ([`ToolError`] variants other than `Transport`) and delegation rejections
//! are recorded in the session as tool responses so the model can correct
//! itself; they never end the run.

use std::time::Duration;

/// Failure talking to a model provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Other(String),
}

/// Failure of the channel to a remote tool server. Fatal to the run.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote tool server closed the connection")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failure of a single tool call.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Tool '{tool}' is not available to this agent ({agent}).")]
    Unavailable { tool: String, agent: String },

    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("tool '{tool}' failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error(
        "tool '{tool}' timed out after {:.0} seconds. Consider breaking the task into smaller steps.",
        after.as_secs_f64()
    )]
    Timeout { tool: String, after: Duration },

    #[error("transport failure calling tool '{tool}': {source}")]
    Transport {
        tool: String,
        #[source]
        source: TransportError,
    },
}

impl ToolError {
    /// Whether the run can continue by feeding this error back to the model.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ToolError::Transport { .. })
    }
}

/// A `transfer_task` call the runtime refused. Recorded as the call's tool
/// response; the delegating agent keeps going.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("Agent '{0}' does not exist.")]
    UnknownAgent(String),

    #[error(
        "Agent '{target}' is not a sub-agent of '{agent}'. Available sub-agents: {available}."
    )]
    NotSubAgent {
        agent: String,
        target: String,
        available: String,
    },

    #[error("Agent '{target}' is already working on this task (delegation chain: {chain}).")]
    Cycle { target: String, chain: String },

    #[error("Maximum delegation depth ({max}) reached. Complete the task without delegating.")]
    DepthExceeded { max: usize },

    #[error(transparent)]
    InvalidArguments(#[from] ToolError),
}

/// Invalid team wiring, detected at construction.
#[derive(Debug, thiserror::Error)]
pub enum TeamError {
    #[error("team has no agents")]
    Empty,

    #[error("root agent '{0}' is not part of the team")]
    MissingRoot(String),

    #[error("agent '{0}' is defined more than once")]
    DuplicateAgent(String),

    #[error("agent '{agent}' lists unknown sub-agent '{sub_agent}'")]
    UnknownSubAgent { agent: String, sub_agent: String },

    #[error("invalid permission pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Errors surfaced by the [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("model provider failed for agent '{agent}': {source}")]
    Provider {
        agent: String,
        #[source]
        source: ProviderError,
    },

    #[error("remote tool '{tool}' is unreachable: {source}")]
    Transport {
        tool: String,
        #[source]
        source: TransportError,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("agent '{agent}' exceeded its turn limit ({limit})")]
    TurnLimitExceeded { agent: String, limit: u32 },

    #[error("runtime already has an active run")]
    Busy,

    #[error("session is in use by another run")]
    SessionBusy,

    #[error("no run is awaiting confirmation")]
    NothingToResume,

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
}

impl RuntimeError {
    /// True for errors that end a run in the `Failed` state, as opposed to
    /// rejections of a request that never started or resumed one.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            RuntimeError::Provider { .. }
                | RuntimeError::Transport { .. }
                | RuntimeError::Cancelled
                | RuntimeError::TurnLimitExceeded { .. }
        )
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_the_only_unrecoverable_tool_error() {
        let transport = ToolError::Transport {
            tool: "remote".into(),
            source: TransportError::Closed,
        };
        assert!(!transport.is_recoverable());

        let exec = ToolError::Execution {
            tool: "add".into(),
            reason: "boom".into(),
        };
        assert!(exec.is_recoverable());
    }

    #[test]
    fn unavailable_message_names_agent() {
        let err = ToolError::Unavailable {
            tool: "rm".into(),
            agent: "root".into(),
        };
        assert_eq!(
            err.to_string(),
            "Tool 'rm' is not available to this agent (root)."
        );
    }

    #[test]
    fn delegation_error_messages() {
        let err = DelegationError::NotSubAgent {
            agent: "root".into(),
            target: "writer".into(),
            available: "researcher".into(),
        };
        assert_eq!(
            err.to_string(),
            "Agent 'writer' is not a sub-agent of 'root'. Available sub-agents: researcher."
        );
        assert_eq!(
            DelegationError::DepthExceeded { max: 3 }.to_string(),
            "Maximum delegation depth (3) reached. Complete the task without delegating."
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(RuntimeError::Cancelled.is_fatal_to_run());
        assert!(
            RuntimeError::TurnLimitExceeded {
                agent: "a".into(),
                limit: 3
            }
            .is_fatal_to_run()
        );
        assert!(!RuntimeError::NothingToResume.is_fatal_to_run());
        assert!(!RuntimeError::Busy.is_fatal_to_run());
    }
}

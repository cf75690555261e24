//! Configuration for the [`Runtime`](super::Runtime).
//!
//! ```ignore
//! let config = RuntimeConfig::default()
//!     .with_max_delegation_depth(2)
//!     .with_parallel_tool_calls(true)
//!     .with_model_timeout(Some(Duration::from_secs(120)));
//! ```
//!
//! The struct also deserializes, with timeouts written in seconds:
//!
//! ```ignore
//! let config: RuntimeConfig = serde_json::from_str(r#"{"tool_timeout": 30, "event_buffer": 256}"#)?;
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum nesting of `transfer_task` frames below the root.
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 3;

/// Capacity of the event channel between producer and consumer.
pub const DEFAULT_EVENT_BUFFER: usize = 128;

/// Fraction of the context window above which the root history is summarized
/// (with [`RuntimeConfig::session_compaction`]).
pub const DEFAULT_COMPACTION_THRESHOLD: f64 = 0.9;

/// Runtime-wide settings. Per-agent settings live on
/// [`Agent`](crate::agent::Agent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Delegated frames allowed below the root frame.
    pub max_delegation_depth: usize,
    /// Bounded channel capacity for streamed events.
    pub event_buffer: usize,
    /// Run consecutive immediately-executable tool calls concurrently.
    pub parallel_tool_calls: bool,
    /// Upper bound on a single tool execution, on top of the toolset's own.
    #[serde(with = "opt_secs")]
    pub tool_timeout: Option<Duration>,
    /// Upper bound on a single model call, including streaming.
    #[serde(with = "opt_secs")]
    pub model_timeout: Option<Duration>,
    /// Emit a final `Error{"cancelled"}` event when a streamed run is cancelled.
    pub emit_cancelled_error: bool,
    /// Persist approve-for-session decisions into the session's
    /// `ApprovedTools` so they outlive the run.
    pub session_scoped_approvals: bool,
    /// Summarize the root agent's history through its own model once the
    /// last call used more than `compaction_threshold` of the context window.
    pub session_compaction: bool,
    pub compaction_threshold: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            event_buffer: DEFAULT_EVENT_BUFFER,
            parallel_tool_calls: false,
            tool_timeout: None,
            model_timeout: None,
            emit_cancelled_error: true,
            session_scoped_approvals: false,
            session_compaction: false,
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl RuntimeConfig {
    pub fn with_max_delegation_depth(mut self, depth: usize) -> Self {
        self.max_delegation_depth = depth;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        // tokio's mpsc panics on a zero capacity.
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn with_parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.parallel_tool_calls = enabled;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_cancelled_error(mut self, enabled: bool) -> Self {
        self.emit_cancelled_error = enabled;
        self
    }

    pub fn with_session_scoped_approvals(mut self, enabled: bool) -> Self {
        self.session_scoped_approvals = enabled;
        self
    }

    pub fn with_session_compaction(mut self, enabled: bool) -> Self {
        self.session_compaction = enabled;
        self
    }

    pub fn with_compaction_threshold(mut self, fraction: f64) -> Self {
        self.compaction_threshold = fraction;
        self
    }
}

/// `Option<Duration>` as fractional seconds.
mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|s| {
                Duration::try_from_secs_f64(s)
                    .map_err(|e| serde::de::Error::custom(format!("invalid timeout {s}: {e}")))
            })
            .transpose()
    }
}

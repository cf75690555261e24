//! Shared conversation state.
//!
//! A [`Session`] is a cheap, cloneable handle. Every read returns a
//! snapshot; every write happens inside a short critical section that is
//! never held across an `.await`, so observers can inspect history and
//! usage while a run is mutating them.

use crate::Message;
use crate::error::TeamError;
use crate::tools::{Permissions, PermissionsConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, trace};
use uuid::Uuid;

/// Delegation frame id of caller-appended messages and the root agent.
pub const ROOT_FRAME: u64 = 0;

/// One recorded message plus who produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEntry {
    pub message: Message,
    /// Agent that produced the message. `None` for caller-appended input.
    pub agent_name: Option<String>,
    /// Delegation frame the message belongs to.
    pub frame: u64,
    pub created_at: DateTime<Utc>,
    /// Marks a compaction summary. Model requests for the frame start here.
    #[serde(default)]
    pub summary: bool,
}

/// Cumulative token and cost accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Estimated size of the most recent request plus reply, in tokens.
    pub context_length: u64,
    pub context_limit: u64,
    /// Accumulated cost in USD.
    pub cost: f64,
    pub model_calls: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Fraction of the context window used by the last call (0.0 when unknown).
    pub fn context_fraction(&self) -> f64 {
        if self.context_limit == 0 {
            0.0
        } else {
            self.context_length as f64 / self.context_limit as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "tokens: {} in + {} out, context: {}/{}, est. cost: ${:.4}",
            self.input_tokens,
            self.output_tokens,
            self.context_length,
            self.context_limit,
            self.cost,
        )
    }
}

/// Usage figures for a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub context_length: u64,
    pub context_limit: u64,
    pub cost: f64,
}

// ── State bag ──────────────────────────────────────────────────────

/// Known keys of the session state bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    /// Skip confirmation for every tool.
    ToolsApproved,
    /// Tools approved for the rest of the session.
    ApprovedTools,
    /// Human-readable session title.
    Title,
    /// Permission patterns checked before the team's.
    Permissions,
}

/// A state value, tagged with its key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "snake_case")]
pub enum StateEntry {
    ToolsApproved(bool),
    ApprovedTools(BTreeSet<String>),
    Title(String),
    Permissions(PermissionsConfig),
}

impl StateEntry {
    pub fn key(&self) -> StateKey {
        match self {
            StateEntry::ToolsApproved(_) => StateKey::ToolsApproved,
            StateEntry::ApprovedTools(_) => StateKey::ApprovedTools,
            StateEntry::Title(_) => StateKey::Title,
            StateEntry::Permissions(_) => StateKey::Permissions,
        }
    }
}

// ── Session ────────────────────────────────────────────────────────

struct Inner {
    id: Uuid,
    created_at: DateTime<Utc>,
    entries: RwLock<Vec<SessionEntry>>,
    state: RwLock<BTreeMap<StateKey, StateEntry>>,
    usage: Mutex<Usage>,
    in_flight: AtomicBool,
    next_frame: AtomicU64,
}

/// Conversation history, typed state and usage totals shared by every agent
/// of a team.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("messages", &self.len())
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4())
    }

    pub fn with_id(id: Uuid) -> Self {
        debug!("Creating session {id}");
        Self {
            inner: Arc::new(Inner {
                id,
                created_at: Utc::now(),
                entries: RwLock::new(Vec::new()),
                state: RwLock::new(BTreeMap::new()),
                usage: Mutex::new(Usage::default()),
                in_flight: AtomicBool::new(false),
                next_frame: AtomicU64::new(ROOT_FRAME + 1),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Append a caller message to the root frame.
    pub fn append(&self, message: Message) {
        self.record(message, None, ROOT_FRAME);
    }

    pub(crate) fn record(&self, message: Message, agent_name: Option<&str>, frame: u64) {
        trace!(
            "session {}: +{} (frame {frame}, agent {})",
            self.inner.id,
            message.role,
            agent_name.unwrap_or("-")
        );
        let entry = SessionEntry {
            message,
            agent_name: agent_name.map(str::to_string),
            frame,
            created_at: Utc::now(),
            summary: false,
        };
        self.entries_mut().push(entry);
    }

    /// Record a compaction summary for `frame`. Earlier messages of the frame
    /// stay in the history but are no longer sent to the model.
    pub(crate) fn record_summary(&self, summary: &str, agent_name: &str, frame: u64) {
        debug!(
            "session {}: summary for frame {frame} ({} chars)",
            self.inner.id,
            summary.len()
        );
        let entry = SessionEntry {
            message: Message::system(format!("Session Summary: {summary}")),
            agent_name: Some(agent_name.to_string()),
            frame,
            created_at: Utc::now(),
            summary: true,
        };
        self.entries_mut().push(entry);
    }

    /// Snapshot of every message, in append order.
    pub fn history(&self) -> Vec<Message> {
        self.entries_ref()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Snapshot of every entry with attribution.
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.entries_ref().clone()
    }

    /// Snapshot of the entries recorded in one delegation frame.
    pub fn frame_entries(&self, frame: u64) -> Vec<SessionEntry> {
        self.entries_ref()
            .iter()
            .filter(|e| e.frame == frame)
            .cloned()
            .collect()
    }

    /// Messages the model sees for `frame`: everything from the frame's latest
    /// summary on, or the whole frame when it was never compacted.
    pub fn frame_history(&self, frame: u64) -> Vec<Message> {
        let entries = self.entries_ref();
        let in_frame: Vec<&SessionEntry> = entries.iter().filter(|e| e.frame == frame).collect();
        let start = in_frame.iter().rposition(|e| e.summary).unwrap_or(0);
        in_frame[start..].iter().map(|e| e.message.clone()).collect()
    }

    pub fn last_message(&self) -> Option<Message> {
        self.entries_ref().last().map(|e| e.message.clone())
    }

    pub fn len(&self) -> usize {
        self.entries_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── State ──

    pub fn state(&self, key: StateKey) -> Option<StateEntry> {
        self.state_ref().get(&key).cloned()
    }

    pub fn set_state(&self, entry: StateEntry) {
        self.state_mut().insert(entry.key(), entry);
    }

    pub fn remove_state(&self, key: StateKey) -> Option<StateEntry> {
        self.state_mut().remove(&key)
    }

    /// Whether every tool call is pre-approved for this session.
    pub fn tools_approved(&self) -> bool {
        matches!(
            self.state(StateKey::ToolsApproved),
            Some(StateEntry::ToolsApproved(true))
        )
    }

    pub fn set_tools_approved(&self, approved: bool) {
        self.set_state(StateEntry::ToolsApproved(approved));
    }

    pub fn approved_tools(&self) -> BTreeSet<String> {
        match self.state(StateKey::ApprovedTools) {
            Some(StateEntry::ApprovedTools(set)) => set,
            _ => BTreeSet::new(),
        }
    }

    pub fn is_tool_approved(&self, tool: &str) -> bool {
        match self.state_ref().get(&StateKey::ApprovedTools) {
            Some(StateEntry::ApprovedTools(set)) => set.contains(tool),
            _ => false,
        }
    }

    /// Approve a tool for the remainder of the session.
    pub fn approve_tool(&self, tool: impl Into<String>) {
        let mut state = self.state_mut();
        let entry = state
            .entry(StateKey::ApprovedTools)
            .or_insert_with(|| StateEntry::ApprovedTools(BTreeSet::new()));
        if let StateEntry::ApprovedTools(set) = entry {
            set.insert(tool.into());
        }
    }

    pub fn title(&self) -> Option<String> {
        match self.state(StateKey::Title) {
            Some(StateEntry::Title(t)) => Some(t),
            _ => None,
        }
    }

    pub fn permissions(&self) -> Option<PermissionsConfig> {
        match self.state(StateKey::Permissions) {
            Some(StateEntry::Permissions(config)) => Some(config),
            _ => None,
        }
    }

    /// Set session permission patterns after checking that they compile.
    pub fn set_permissions(&self, config: PermissionsConfig) -> Result<(), TeamError> {
        Permissions::compile(&config)?;
        self.set_state(StateEntry::Permissions(config));
        Ok(())
    }

    // ── Usage ──

    pub fn usage(&self) -> Usage {
        self.usage_guard().clone()
    }

    /// Fold one model call into the running totals.
    pub fn record_usage(&self, call: CallUsage) {
        let mut usage = self.usage_guard();
        usage.input_tokens += call.input_tokens;
        usage.output_tokens += call.output_tokens;
        usage.context_length = call.context_length;
        usage.context_limit = call.context_limit;
        usage.cost += call.cost;
        usage.model_calls += 1;
    }

    // ── Run bookkeeping ──

    /// Claim the session for a run. `None` when another run holds it.
    pub(crate) fn try_lease(&self) -> Option<SessionLease> {
        self.inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SessionLease {
                session: self.clone(),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn next_frame_id(&self) -> u64 {
        self.inner.next_frame.fetch_add(1, Ordering::Relaxed)
    }

    fn entries_ref(&self) -> std::sync::RwLockReadGuard<'_, Vec<SessionEntry>> {
        self.inner.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn entries_mut(&self) -> std::sync::RwLockWriteGuard<'_, Vec<SessionEntry>> {
        self.inner.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state_ref(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<StateKey, StateEntry>> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<StateKey, StateEntry>> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn usage_guard(&self) -> std::sync::MutexGuard<'_, Usage> {
        self.inner.usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Marks a session as owned by one run; released on drop.
#[derive(Debug)]
pub(crate) struct SessionLease {
    session: Session,
}

impl SessionLease {
    pub(crate) fn session(&self) -> &Session {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.inner.in_flight.store(false, Ordering::Release);
    }
}

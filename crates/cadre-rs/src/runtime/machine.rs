//! The turn loop.
//!
//! A run is an explicit [`ActiveRun`] value: a stack of frames (one per
//! active agent, the root at the bottom) and the current [`TurnState`].
//! [`ActiveRun::drive`] advances it until the root agent answers, a tool call
//! needs confirmation, or something fatal happens. A suspended run is just
//! this value parked in the runtime; resuming applies the caller's decision
//! and drives again.
//!
//! ```text
//! Idle -> AwaitingModel -> ExecutingTools | Done | Failed
//! ExecutingTools -> AwaitingConfirmation | Delegating | AwaitingModel
//! AwaitingConfirmation -> ExecutingTools
//! Delegating -> ExecutingTools | AwaitingModel (delegate frame)
//! ```

use super::config::RuntimeConfig;
use super::dispatch::{self, Disposition};
use super::events::{Event, EventSink};
use super::ResumeDecision;
use crate::agent::{Agent, Team, build_request};
use crate::error::{ProviderError, Result, RuntimeError};
use crate::provider::{Completion, CompletionRequest, StreamAccumulator, StreamEvent};
use crate::session::{ROOT_FRAME, Session, SessionLease};
use crate::tools::{EMPTY_OUTPUT, ToolResult};
use crate::usage::measure_call;
use crate::{Message, ToolCall};
use futures::StreamExt;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Recorded for every call abandoned by a cancelled run.
pub const CANCELLED_TOOL_MESSAGE: &str = "The tool call was canceled by the user.";

/// Recorded for a call the user refused.
pub const REJECTED_TOOL_MESSAGE: &str = "The user rejected the tool call.";

/// Where a run is in the turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingModel,
    ExecutingTools,
    AwaitingConfirmation,
    Delegating,
    Done,
    Failed,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One active agent. The root frame is at the bottom of the stack.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) id: u64,
    pub(crate) agent: Arc<Agent>,
    /// Model calls made in this frame.
    pub(crate) turns: u32,
    /// Tool calls from the last model turn that have no response yet.
    pub(crate) batch: VecDeque<ToolCall>,
    /// The parent's `transfer_task` call that opened this frame.
    pub(crate) origin: Option<ToolCall>,
}

impl Frame {
    pub(crate) fn new(id: u64, agent: Arc<Agent>, origin: Option<ToolCall>) -> Self {
        Self {
            id,
            agent,
            turns: 0,
            batch: VecDeque::new(),
            origin,
        }
    }
}

/// Why [`ActiveRun::drive`] returned.
#[derive(Debug)]
pub(crate) enum Driven {
    Completed { agent_name: String, content: String },
    Suspended { agent_name: String, call: ToolCall },
}

/// What one step of the loop produced.
pub(super) enum Step {
    Continue,
    Finished(String),
    Suspend(ToolCall),
}

/// A run in progress or parked for confirmation.
pub(crate) struct ActiveRun {
    pub(crate) run_id: String,
    lease: SessionLease,
    pub(super) team: Arc<Team>,
    pub(super) config: Arc<RuntimeConfig>,
    pub(super) stack: Vec<Frame>,
    state: TurnState,
    /// Tools approved for the rest of this run.
    pub(super) approvals: BTreeSet<String>,
    started: Instant,
}

impl fmt::Debug for ActiveRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRun")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("depth", &self.stack.len())
            .finish_non_exhaustive()
    }
}

impl ActiveRun {
    pub(crate) fn new(
        run_id: String,
        lease: SessionLease,
        team: Arc<Team>,
        config: Arc<RuntimeConfig>,
    ) -> Self {
        let root = Frame::new(ROOT_FRAME, Arc::clone(team.root()), None);
        Self {
            run_id,
            lease,
            team,
            config,
            stack: vec![root],
            state: TurnState::Idle,
            approvals: BTreeSet::new(),
            started: Instant::now(),
        }
    }

    pub(crate) fn session(&self) -> &Session {
        self.lease.session()
    }

    pub(crate) fn state(&self) -> TurnState {
        self.state
    }

    pub(super) fn transition(&mut self, to: TurnState) {
        if self.state != to {
            trace!("[{}] {} -> {to}", self.run_id, self.state);
            self.state = to;
        }
    }

    /// The innermost frame.
    pub(super) fn top(&self) -> &Frame {
        // The root frame is never popped while the run is live.
        &self.stack[self.stack.len() - 1]
    }

    pub(super) fn top_mut(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last]
    }

    /// Name of the agent currently in control.
    pub(crate) fn active_agent_name(&self) -> String {
        self.stack
            .last()
            .map(|f| f.agent.name.clone())
            .unwrap_or_else(|| self.team.root_name().to_string())
    }

    pub(crate) fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    // ── Driving ──

    /// Advance until the run completes, suspends or fails.
    pub(crate) async fn drive(&mut self, sink: &EventSink) -> Result<Driven> {
        if self.state == TurnState::Idle {
            self.transition(TurnState::AwaitingModel);
        }
        loop {
            if sink.token().is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let step = match self.state {
                TurnState::AwaitingModel => self.model_turn(sink).await?,
                TurnState::ExecutingTools => self.execute_batch(sink).await?,
                // Entered and left within a single step.
                TurnState::Delegating | TurnState::AwaitingConfirmation => {
                    self.transition(TurnState::ExecutingTools);
                    Step::Continue
                }
                TurnState::Idle | TurnState::Done | TurnState::Failed => {
                    warn!("[{}] drive called in terminal state {}", self.run_id, self.state);
                    return Err(RuntimeError::NothingToResume);
                }
            };
            match step {
                Step::Continue => {}
                Step::Finished(content) => {
                    self.transition(TurnState::Done);
                    return Ok(Driven::Completed {
                        agent_name: self.active_agent_name(),
                        content,
                    });
                }
                Step::Suspend(call) => {
                    self.transition(TurnState::AwaitingConfirmation);
                    return Ok(Driven::Suspended {
                        agent_name: self.active_agent_name(),
                        call,
                    });
                }
            }
        }
    }

    async fn model_turn(&mut self, sink: &EventSink) -> Result<Step> {
        let agent = Arc::clone(&self.top().agent);
        let frame_id = self.top().id;
        let turns = self.top().turns;

        if agent.turn_limit_reached(turns) {
            if self.stack.len() == 1 {
                info!("Agent {} hit turn limit ({})", agent.name, agent.max_iterations);
                return Err(RuntimeError::TurnLimitExceeded {
                    agent: agent.name.clone(),
                    limit: agent.max_iterations,
                });
            }
            info!(
                "Delegate {} hit turn limit ({}), returning to parent",
                agent.name, agent.max_iterations
            );
            let message = format!(
                "Error: agent '{}' reached its turn limit ({}) before completing the task.",
                agent.name, agent.max_iterations
            );
            self.complete_child(sink, ToolResult::error(message)).await?;
            return Ok(Step::Continue);
        }
        self.top_mut().turns += 1;

        if self.stack.len() == 1 {
            self.compact_if_needed(&agent, sink).await?;
        }
        let history = self.session().frame_history(frame_id);
        let request = build_request(&agent, &self.team, history);
        debug!(
            "[{}] turn {}/{} for {}: {} message(s), {} tool(s)",
            self.run_id,
            turns + 1,
            agent.max_iterations,
            agent.name,
            request.messages.len(),
            request.tools.len()
        );

        let completion = self.call_model(&agent, &request, sink).await?;
        let usage = measure_call(
            agent.model.model_id(),
            agent.model.context_limit(),
            &request,
            &completion,
        );
        self.session().record_usage(usage);

        let Completion {
            content,
            tool_calls,
            ..
        } = completion;
        self.session().record(
            Message::assistant(content.clone(), tool_calls.clone()),
            Some(&agent.name),
            frame_id,
        );

        if tool_calls.is_empty() {
            let content = content.unwrap_or_default();
            if self.stack.len() == 1 {
                debug!("[{}] {} finished", self.run_id, agent.name);
                return Ok(Step::Finished(content));
            }
            let output = if content.trim().is_empty() {
                EMPTY_OUTPUT.to_string()
            } else {
                content
            };
            self.complete_child(sink, ToolResult::ok(output)).await?;
            return Ok(Step::Continue);
        }

        debug!(
            "[{}] {} requested {} tool call(s)",
            self.run_id,
            agent.name,
            tool_calls.len()
        );
        self.top_mut().batch = tool_calls.into();
        self.transition(TurnState::ExecutingTools);
        Ok(Step::Continue)
    }

    /// Stream one model response, forwarding text deltas as events.
    async fn call_model(
        &self,
        agent: &Agent,
        request: &CompletionRequest,
        sink: &EventSink,
    ) -> Result<Completion> {
        let provider_err = |source: ProviderError| RuntimeError::Provider {
            agent: agent.name.clone(),
            source,
        };

        let streamed = async {
            let mut deltas = agent.model.stream(request).await.map_err(provider_err)?;
            let mut acc = StreamAccumulator::default();
            while let Some(event) = deltas.next().await {
                let event = event.map_err(provider_err)?;
                if let StreamEvent::TextDelta(delta) = &event {
                    sink.emit(Event::AgentChoice {
                        agent_name: agent.name.clone(),
                        delta: delta.clone(),
                    })
                    .await?;
                }
                let done = event == StreamEvent::Done;
                acc.push(event);
                if done {
                    break;
                }
            }
            Ok(acc.finish())
        };

        let bounded = async {
            match self.config.model_timeout {
                Some(limit) => match tokio::time::timeout(limit, streamed).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("Model call for {} timed out after {limit:?}", agent.name);
                        Err(provider_err(ProviderError::Timeout(limit)))
                    }
                },
                None => streamed.await,
            }
        };

        tokio::select! {
            biased;
            _ = sink.token().cancelled() => Err(RuntimeError::Cancelled),
            result = bounded => result,
        }
    }

    // ── Tool batches ──

    async fn execute_batch(&mut self, sink: &EventSink) -> Result<Step> {
        loop {
            if sink.token().is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let Some(call) = self.top().batch.front().cloned() else {
                self.transition(TurnState::AwaitingModel);
                return Ok(Step::Continue);
            };

            match self.classify(&call) {
                Disposition::Delegate => {
                    self.transition(TurnState::Delegating);
                    self.delegate(call, sink).await?;
                    // A pushed delegate frame starts with a model turn.
                    if self.state == TurnState::AwaitingModel {
                        return Ok(Step::Continue);
                    }
                    self.transition(TurnState::ExecutingTools);
                }
                Disposition::Respond(result) => {
                    self.resolve(&call, result, sink).await?;
                }
                Disposition::NeedsConfirmation => {
                    debug!(
                        "[{}] {} needs confirmation (call {})",
                        self.run_id,
                        call.name(),
                        call.id
                    );
                    return Ok(Step::Suspend(call));
                }
                Disposition::Ready => {
                    let ready = if self.config.parallel_tool_calls {
                        self.ready_prefix()
                    } else {
                        1
                    };
                    if ready > 1 {
                        self.run_parallel(ready, sink).await?;
                    } else {
                        self.run_tool(call, sink).await?;
                    }
                }
            }
        }
    }

    pub(super) fn classify(&self, call: &ToolCall) -> Disposition {
        dispatch::classify(
            &self.top().agent,
            &self.team,
            self.session(),
            &self.approvals,
            call,
        )
    }

    /// Number of calls at the front of the batch that can run right away.
    fn ready_prefix(&self) -> usize {
        self.top()
            .batch
            .iter()
            .take_while(|call| matches!(self.classify(call), Disposition::Ready))
            .count()
    }

    /// Execute the call at the front of the batch and record its response.
    pub(super) async fn run_tool(&mut self, call: ToolCall, sink: &EventSink) -> Result<()> {
        let agent = Arc::clone(&self.top().agent);
        sink.emit(Event::ToolCall {
            agent_name: agent.name.clone(),
            call: call.clone(),
        })
        .await?;
        let result =
            dispatch::execute(&agent.tools, &call, sink.token(), self.config.tool_timeout).await?;
        self.resolve(&call, result, sink).await
    }

    /// Execute the first `count` calls concurrently; record in call order.
    async fn run_parallel(&mut self, count: usize, sink: &EventSink) -> Result<()> {
        let agent = Arc::clone(&self.top().agent);
        let calls: Vec<ToolCall> = self.top().batch.iter().take(count).cloned().collect();
        debug!(
            "[{}] executing {} tool call(s) in parallel for {}",
            self.run_id,
            calls.len(),
            agent.name
        );
        for call in &calls {
            sink.emit(Event::ToolCall {
                agent_name: agent.name.clone(),
                call: call.clone(),
            })
            .await?;
        }

        let token = sink.token();
        let timeout = self.config.tool_timeout;
        let results = futures::future::join_all(
            calls
                .iter()
                .map(|call| dispatch::execute(&agent.tools, call, token, timeout)),
        )
        .await;

        for (call, result) in calls.iter().zip(results) {
            self.resolve(call, result?, sink).await?;
        }
        Ok(())
    }

    /// Record the response for the call at the front of the active batch.
    pub(super) async fn resolve(
        &mut self,
        call: &ToolCall,
        result: ToolResult,
        sink: &EventSink,
    ) -> Result<()> {
        let frame = self.top_mut();
        if frame.batch.front().is_some_and(|c| c.id == call.id) {
            frame.batch.pop_front();
        } else {
            warn!("Resolved call {} is not at the front of the batch", call.id);
            frame.batch.retain(|c| c.id != call.id);
        }
        let agent_name = frame.agent.name.clone();
        let frame_id = frame.id;
        self.session().record(
            Message::tool_result(&call.id, &result.output),
            Some(&agent_name),
            frame_id,
        );
        sink.emit(Event::ToolCallResponse {
            agent_name,
            call: call.clone(),
            result,
        })
        .await
    }

    // ── Confirmation ──

    /// Apply the caller's decision to the call awaiting confirmation.
    pub(crate) async fn apply_decision(
        &mut self,
        decision: ResumeDecision,
        sink: &EventSink,
    ) -> Result<()> {
        let Some(call) = self.top().batch.front().cloned() else {
            self.transition(TurnState::ExecutingTools);
            return Ok(());
        };
        self.transition(TurnState::ExecutingTools);
        match decision {
            ResumeDecision::ApproveOnce => {
                debug!("[{}] {} approved once", self.run_id, call.name());
                self.run_tool(call, sink).await
            }
            ResumeDecision::ApproveSession => {
                debug!("[{}] {} approved for session", self.run_id, call.name());
                self.approvals.insert(call.name().to_string());
                if self.config.session_scoped_approvals {
                    self.session().approve_tool(call.name());
                }
                self.run_tool(call, sink).await
            }
            ResumeDecision::Deny { reason } => {
                debug!("[{}] {} rejected", self.run_id, call.name());
                let mut message = REJECTED_TOOL_MESSAGE.to_string();
                if let Some(reason) = reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                    message.push_str(" Reason: ");
                    message.push_str(reason);
                }
                self.resolve(&call, ToolResult::error(message), sink).await
            }
        }
    }

    // ── Delegation completion ──

    /// Pop the active delegate frame and answer its origin call in the parent.
    pub(super) async fn complete_child(
        &mut self,
        sink: &EventSink,
        result: ToolResult,
    ) -> Result<()> {
        let Some(child) = self.stack.pop() else {
            return Ok(());
        };
        let Some(origin) = child.origin else {
            // Only the root frame has no origin, and it is never completed here.
            self.stack.push(child);
            return Ok(());
        };
        info!(
            "Task transfer completed: {} -> {} ({} turn(s))",
            child.agent.name,
            self.top().agent.name,
            child.turns
        );
        let parent = self.top();
        let (agent_name, frame_id) = (parent.agent.name.clone(), parent.id);
        self.session().record(
            Message::tool_result(&origin.id, &result.output),
            Some(&agent_name),
            frame_id,
        );
        self.transition(TurnState::ExecutingTools);
        sink.emit(Event::ToolCallResponse {
            agent_name,
            call: origin,
            result,
        })
        .await
    }

    // ── Teardown ──

    /// Answer every unresolved call with `reason`, innermost frame first,
    /// so the session never holds a call without a response.
    pub(crate) fn unwind(&mut self, reason: &str) -> usize {
        let mut recorded = 0;
        while let Some(frame) = self.stack.pop() {
            for call in &frame.batch {
                self.lease.session().record(
                    Message::tool_result(&call.id, reason),
                    Some(&frame.agent.name),
                    frame.id,
                );
                recorded += 1;
            }
            if let (Some(origin), Some(parent)) = (&frame.origin, self.stack.last()) {
                self.lease.session().record(
                    Message::tool_result(&origin.id, reason),
                    Some(&parent.agent.name),
                    parent.id,
                );
                recorded += 1;
            }
        }
        if recorded > 0 {
            debug!("[{}] unwound {recorded} pending call(s)", self.run_id);
        }
        self.transition(TurnState::Failed);
        recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::provider::ScriptedProvider;
    use crate::runtime::events::NoopHandler;
    use tokio_util::sync::CancellationToken;

    fn run_for(agent: Agent, session: &Session) -> ActiveRun {
        ActiveRun::new(
            "run-test".into(),
            session.try_lease().unwrap(),
            Arc::new(Team::single(agent)),
            Arc::new(RuntimeConfig::default()),
        )
    }

    fn sink() -> EventSink {
        EventSink::handler_only(Arc::new(NoopHandler), CancellationToken::new())
    }

    #[tokio::test]
    async fn text_reply_completes() {
        let model = Arc::new(ScriptedProvider::new("m").then_text("hello"));
        let session = Session::new();
        session.append(Message::user("hi"));
        let mut run = run_for(Agent::new("root", model), &session);

        let driven = run.drive(&sink()).await.unwrap();
        assert!(matches!(driven, Driven::Completed { ref content, .. } if content == "hello"));
        assert_eq!(run.state(), TurnState::Done);
        assert_eq!(session.usage().model_calls, 1);
        let entries = session.entries();
        assert_eq!(entries[1].agent_name.as_deref(), Some("root"));
    }

    #[tokio::test]
    async fn unwind_answers_pending_calls() {
        let session = Session::new();
        let model = Arc::new(ScriptedProvider::new("m"));
        let mut run = run_for(Agent::new("root", model), &session);
        session.record(
            Message::assistant(
                None,
                vec![ToolCall::new("a", "x", "{}"), ToolCall::new("b", "y", "{}")],
            ),
            Some("root"),
            ROOT_FRAME,
        );
        run.top_mut().batch = vec![ToolCall::new("a", "x", "{}"), ToolCall::new("b", "y", "{}")].into();

        assert_eq!(run.unwind(CANCELLED_TOOL_MESSAGE), 2);
        assert_eq!(run.state(), TurnState::Failed);
        let history = session.history();
        assert_eq!(history[1].tool_call_id.as_deref(), Some("a"));
        assert_eq!(history[2].text(), CANCELLED_TOOL_MESSAGE);
    }

    #[tokio::test]
    async fn lease_is_released_with_run() {
        let session = Session::new();
        let run = run_for(Agent::new("root", Arc::new(ScriptedProvider::new("m"))), &session);
        assert!(session.is_in_flight());
        drop(run);
        assert!(!session.is_in_flight());
    }
}

//! The runtime: drives a [`Team`] over a [`Session`].
//!
//! A [`Runtime`] owns at most one run at a time. A run is either in flight
//! on some task or parked in the runtime waiting for a confirmation
//! decision. The two entry points differ only in how events reach the
//! caller:
//!
//! - [`Runtime::run`] drives inline and returns a [`RunOutcome`]. Events go
//!   to the registered [`EventHandler`] only.
//! - [`Runtime::run_stream`] spawns the run and returns an [`EventStream`].
//!
//! A suspended run continues with [`Runtime::resume`] (spawned, events keep
//! flowing on the original stream) or [`Runtime::resume_run`] (inline).
//!
//! ```ignore
//! let runtime = Runtime::new(team).with_event_handler(LoggingHandler);
//! let session = Session::new();
//! session.append(Message::user("Delete the build directory"));
//!
//! match runtime.run(&session).await? {
//!     RunOutcome::Completed { content, .. } => println!("{content}"),
//!     RunOutcome::AwaitingConfirmation { call, .. } => {
//!         println!("approve {}?", call.name());
//!         runtime.resume_run(ResumeDecision::ApproveOnce).await?;
//!     }
//! }
//! ```

mod compaction;
pub mod config;
mod delegation;
mod dispatch;
pub mod events;
mod machine;

pub use config::{
    DEFAULT_COMPACTION_THRESHOLD, DEFAULT_EVENT_BUFFER, DEFAULT_MAX_DELEGATION_DEPTH, RuntimeConfig,
};
pub use events::{
    CompositeEventHandler, Event, EventHandler, EventStream, FnEventHandler, LoggingHandler,
    NoopHandler,
};
pub use machine::{CANCELLED_TOOL_MESSAGE, REJECTED_TOOL_MESSAGE, TurnState};

use crate::ToolCall;
use crate::agent::Team;
use crate::error::{Result, RuntimeError};
use crate::session::Session;
use events::EventSink;
use machine::{ActiveRun, Driven};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The caller's answer to a [`Event::ToolCallConfirmation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Run this call only.
    ApproveOnce,
    /// Run this call and skip confirmation for the same tool for the rest of
    /// the run (and the session, with
    /// [`RuntimeConfig::session_scoped_approvals`]).
    ApproveSession,
    /// Refuse the call. The reason is passed on to the model.
    Deny { reason: Option<String> },
}

impl ResumeDecision {
    pub fn deny(reason: impl Into<String>) -> Self {
        ResumeDecision::Deny {
            reason: Some(reason.into()),
        }
    }
}

/// How a run driven inline came to rest.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The root agent answered.
    Completed { agent_name: String, content: String },
    /// The run is parked until [`Runtime::resume`] or
    /// [`Runtime::resume_run`].
    AwaitingConfirmation { agent_name: String, call: ToolCall },
}

/// Generate a unique identifier for one run.
pub fn generate_trace_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tr-{ts:x}-{count:04x}")
}

// ── Slot ───────────────────────────────────────────────────────────

struct Suspended {
    run: ActiveRun,
    sink: EventSink,
    agent_name: String,
    call: ToolCall,
    /// Resolves once `ToolCallConfirmation` has been delivered. A
    /// continuation waits on it so its events never overtake the
    /// confirmation.
    announced: oneshot::Receiver<()>,
    /// Dropped when the run is taken out of the slot, which stops the
    /// cancellation watcher.
    _release: oneshot::Sender<()>,
}

enum Slot {
    Idle,
    Running {
        trace_id: String,
        token: CancellationToken,
    },
    Suspended(Box<Suspended>),
}

// ── Runtime ────────────────────────────────────────────────────────

/// Drives one team. Cheap to clone; clones share the run slot.
#[derive(Clone)]
pub struct Runtime {
    team: Arc<Team>,
    config: Arc<RuntimeConfig>,
    handler: Arc<dyn EventHandler>,
    slot: Arc<Mutex<Slot>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.team.root_name())
            .field("agents", &self.team.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(team: Team) -> Self {
        Self {
            team: Arc::new(team),
            config: Arc::new(RuntimeConfig::default()),
            handler: Arc::new(NoopHandler),
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Whether a run is in flight or suspended.
    pub fn is_busy(&self) -> bool {
        !matches!(*self.lock_slot(), Slot::Idle)
    }

    /// Trace id of the current run, if any.
    pub fn active_trace_id(&self) -> Option<String> {
        match &*self.lock_slot() {
            Slot::Idle => None,
            Slot::Running { trace_id, .. } => Some(trace_id.clone()),
            Slot::Suspended(parked) => Some(parked.run.run_id.clone()),
        }
    }

    /// The call a suspended run is waiting on.
    pub fn pending_confirmation(&self) -> Option<ToolCall> {
        match &*self.lock_slot() {
            Slot::Suspended(parked) => Some(parked.call.clone()),
            _ => None,
        }
    }

    /// Drive a run for `session` until it completes or suspends.
    pub async fn run(&self, session: &Session) -> Result<RunOutcome> {
        let token = CancellationToken::new();
        let run = self.start(session, token.clone())?;
        let sink = EventSink::handler_only(Arc::clone(&self.handler), token);
        self.begin(run, sink).await
    }

    /// Start a run on a spawned task and stream its events.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run_stream(&self, session: &Session) -> Result<EventStream> {
        let token = CancellationToken::new();
        let run = self.start(session, token.clone())?;
        let (sink, stream) =
            EventSink::channel(Arc::clone(&self.handler), token, self.config.event_buffer);
        let this = self.clone();
        tokio::spawn(async move {
            // Failures are reported as events and logged in `settle`.
            let _ = this.begin(run, sink).await;
        });
        Ok(stream)
    }

    /// Continue a suspended run on a spawned task. Events go to the stream
    /// (and handler) the run was started with.
    pub fn resume(&self, decision: ResumeDecision) -> Result<()> {
        let parked = self.take_suspended()?;
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.proceed(*parked, decision).await;
        });
        Ok(())
    }

    /// Continue a suspended run inline.
    pub async fn resume_run(&self, decision: ResumeDecision) -> Result<RunOutcome> {
        let parked = self.take_suspended()?;
        self.proceed(*parked, decision).await
    }

    /// Cancel the current run, whether in flight or suspended. Returns
    /// whether there was anything to cancel.
    pub fn cancel(&self) -> bool {
        let slot = self.lock_slot();
        let token = match &*slot {
            Slot::Idle => return false,
            Slot::Running { token, .. } => token,
            Slot::Suspended(parked) => parked.sink.token(),
        };
        debug!("Cancelling active run");
        token.cancel();
        true
    }

    // ── Internals ──

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start(&self, session: &Session, token: CancellationToken) -> Result<ActiveRun> {
        let mut slot = self.lock_slot();
        if !matches!(*slot, Slot::Idle) {
            return Err(RuntimeError::Busy);
        }
        let lease = session.try_lease().ok_or(RuntimeError::SessionBusy)?;
        let trace_id = generate_trace_id();
        info!(
            "Run started: trace_id={trace_id}, session={}, agent={}, model={}",
            session.id(),
            self.team.root_name(),
            self.team.root().model.model_id()
        );
        *slot = Slot::Running {
            trace_id: trace_id.clone(),
            token,
        };
        Ok(ActiveRun::new(
            trace_id,
            lease,
            Arc::clone(&self.team),
            Arc::clone(&self.config),
        ))
    }

    async fn begin(&self, mut run: ActiveRun, sink: EventSink) -> Result<RunOutcome> {
        debug!(
            "[{}] driving (streaming={})",
            run.run_id,
            sink.is_streaming()
        );
        let started = sink
            .emit(Event::StreamStarted {
                session_id: run.session().id(),
                agent_name: self.team.root_name().to_string(),
            })
            .await;
        let driven = match started {
            Ok(()) => run.drive(&sink).await,
            Err(err) => Err(err),
        };
        self.settle(run, sink, driven).await
    }

    async fn proceed(&self, parked: Suspended, decision: ResumeDecision) -> Result<RunOutcome> {
        let Suspended {
            mut run,
            sink,
            announced,
            ..
        } = parked;
        // Err: the suspending task went away mid-delivery. Nothing to wait for.
        let _ = announced.await;
        debug!("[{}] resuming from {} with {decision:?}", run.run_id, run.state());
        let driven = match run.apply_decision(decision, &sink).await {
            Ok(()) => run.drive(&sink).await,
            Err(err) => Err(err),
        };
        self.settle(run, sink, driven).await
    }

    fn take_suspended(&self) -> Result<Box<Suspended>> {
        let mut slot = self.lock_slot();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Suspended(parked) => {
                *slot = Slot::Running {
                    trace_id: parked.run.run_id.clone(),
                    token: parked.sink.token().clone(),
                };
                Ok(parked)
            }
            other => {
                *slot = other;
                Err(RuntimeError::NothingToResume)
            }
        }
    }

    /// Record how a drive ended: complete, park or fail the run.
    async fn settle(
        &self,
        mut run: ActiveRun,
        sink: EventSink,
        driven: Result<Driven>,
    ) -> Result<RunOutcome> {
        let session_id = run.session().id();
        let root_name = self.team.root_name().to_string();

        match driven {
            Ok(Driven::Completed {
                agent_name,
                content,
            }) => {
                info!(
                    "Run completed: trace_id={}, elapsed={:.1}s, {}",
                    run.run_id,
                    run.elapsed_secs(),
                    run.session().usage().summary()
                );
                drop(run);
                *self.lock_slot() = Slot::Idle;
                sink.emit_final(Event::StreamStopped {
                    session_id,
                    agent_name: root_name,
                })
                .await;
                Ok(RunOutcome::Completed {
                    agent_name,
                    content,
                })
            }
            Ok(Driven::Suspended { agent_name, call }) => {
                info!(
                    "Run suspended: trace_id={}, awaiting confirmation for {} (call {})",
                    run.run_id,
                    call.name(),
                    call.id
                );
                let trace_id = run.run_id.clone();
                let token = sink.token().clone();
                let (release, released) = oneshot::channel();
                let (announce, announced) = oneshot::channel();
                // Parked before the event goes out so a caller reacting to it
                // can resume; the continuation holds back until `announce`.
                *self.lock_slot() = Slot::Suspended(Box::new(Suspended {
                    run,
                    sink: sink.clone(),
                    agent_name: agent_name.clone(),
                    call: call.clone(),
                    announced,
                    _release: release,
                }));
                self.watch_suspended(trace_id, token, released);

                let delivered = sink
                    .emit(Event::ToolCallConfirmation {
                        agent_name: agent_name.clone(),
                        call: call.clone(),
                    })
                    .await;
                let _ = announce.send(());
                delivered?;
                Ok(RunOutcome::AwaitingConfirmation { agent_name, call })
            }
            Err(err) => {
                let failing_agent = run.active_agent_name();
                let cancelled = matches!(err, RuntimeError::Cancelled);
                let reason = if cancelled {
                    CANCELLED_TOOL_MESSAGE.to_string()
                } else {
                    format!("Error: run failed: {err}")
                };
                run.unwind(&reason);
                // A cancelled run is reported by the root once every frame is unwound.
                let agent_name = if cancelled {
                    run.active_agent_name()
                } else {
                    failing_agent
                };
                if cancelled {
                    info!("Run cancelled: trace_id={}", run.run_id);
                } else {
                    warn!("Run failed: trace_id={}: {err}", run.run_id);
                }
                drop(run);
                *self.lock_slot() = Slot::Idle;

                if !cancelled || self.config.emit_cancelled_error {
                    sink.emit_final(Event::Error {
                        agent_name: Some(agent_name),
                        error: err.to_string(),
                    })
                    .await;
                }
                if !cancelled {
                    sink.emit_final(Event::StreamStopped {
                        session_id,
                        agent_name: root_name,
                    })
                    .await;
                }
                Err(err)
            }
        }
    }

    /// Tear down a parked run if it is cancelled before anyone resumes it.
    fn watch_suspended(
        &self,
        trace_id: String,
        token: CancellationToken,
        released: oneshot::Receiver<()>,
    ) {
        let slot = Arc::clone(&self.slot);
        let emit_cancelled = self.config.emit_cancelled_error;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = released => return,
            }

            let parked = {
                let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                match std::mem::replace(&mut *slot, Slot::Idle) {
                    Slot::Suspended(parked) if parked.run.run_id == trace_id => Some(parked),
                    other => {
                        *slot = other;
                        None
                    }
                }
            };
            let Some(parked) = parked else {
                return;
            };

            let Suspended { mut run, sink, .. } = *parked;
            let unwound = run.unwind(CANCELLED_TOOL_MESSAGE);
            let agent_name = run.active_agent_name();
            info!("Suspended run cancelled: trace_id={trace_id}, {unwound} call(s) abandoned");
            drop(run);
            if emit_cancelled {
                sink.emit_final(Event::Error {
                    agent_name: Some(agent_name),
                    error: RuntimeError::Cancelled.to_string(),
                })
                .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::agent::Agent;
    use crate::provider::ScriptedProvider;

    #[test]
    fn trace_ids_are_unique() {
        let a = generate_trace_id();
        let b = generate_trace_id();
        assert!(a.starts_with("tr-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn resume_without_suspension_is_rejected() {
        let model = Arc::new(ScriptedProvider::new("m"));
        let runtime = Runtime::new(Team::single(Agent::new("root", model.clone())));
        assert!(matches!(
            runtime.resume_run(ResumeDecision::ApproveOnce).await,
            Err(RuntimeError::NothingToResume)
        ));
        assert!(matches!(
            runtime.resume(ResumeDecision::ApproveOnce),
            Err(RuntimeError::NothingToResume)
        ));
        assert!(model.requests().is_empty());
        assert!(!runtime.cancel());
    }

    #[tokio::test]
    async fn slot_returns_to_idle() {
        let model = Arc::new(ScriptedProvider::new("m").then_text("hi").then_fail("boom"));
        let runtime = Runtime::new(Team::single(Agent::new("root", model)));
        let session = Session::new();
        session.append(Message::user("hello"));

        runtime.run(&session).await.unwrap();
        assert!(!runtime.is_busy());
        assert!(!session.is_in_flight());

        assert!(matches!(
            runtime.run(&session).await,
            Err(RuntimeError::Provider { .. })
        ));
        assert!(!runtime.is_busy());
        assert!(!session.is_in_flight());
    }

    #[test]
    fn deny_helper_carries_reason() {
        assert_eq!(
            ResumeDecision::deny("not now"),
            ResumeDecision::Deny {
                reason: Some("not now".into())
            }
        );
    }
}

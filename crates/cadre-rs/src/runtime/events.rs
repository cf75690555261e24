//! Runtime events, observers and the streaming channel.
//!
//! Every run reports what it does as a sequence of [`Event`]s. Events reach
//! callers two ways:
//!
//! - [`EventHandler`]s registered on the runtime see every event, in both
//!   [`run`](super::Runtime::run) and [`run_stream`](super::Runtime::run_stream)
//!   mode.
//! - [`EventStream`] receives them over a bounded channel in streaming mode.
//!
//! # Choosing an event handler
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests, or when only the stream matters |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::ToolCall;
use crate::error::{Result, RuntimeError};
use crate::tools::ToolResult;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

// ── Events ─────────────────────────────────────────────────────────

/// Something that happened during a run.
///
/// `agent_name` is always the agent active when the event was produced: a
/// delegate's events carry the delegate's name, and the response to the
/// delegating `transfer_task` call carries the parent's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Emitted once when a run starts.
    StreamStarted { session_id: Uuid, agent_name: String },
    /// Incremental model text.
    AgentChoice { agent_name: String, delta: String },
    /// A tool call is about to execute.
    ToolCall { agent_name: String, call: ToolCall },
    /// The run is suspended until the caller resumes with a decision.
    ToolCallConfirmation { agent_name: String, call: ToolCall },
    /// A tool call was resolved and its response recorded.
    ToolCallResponse {
        agent_name: String,
        call: ToolCall,
        result: ToolResult,
    },
    /// The run failed.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent_name: Option<String>,
        error: String,
    },
    /// The run ended.
    StreamStopped { session_id: Uuid, agent_name: String },
}

impl Event {
    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Event::StreamStarted { agent_name, .. }
            | Event::AgentChoice { agent_name, .. }
            | Event::ToolCall { agent_name, .. }
            | Event::ToolCallConfirmation { agent_name, .. }
            | Event::ToolCallResponse { agent_name, .. }
            | Event::StreamStopped { agent_name, .. } => Some(agent_name),
            Event::Error { agent_name, .. } => agent_name.as_deref(),
        }
    }

    /// Whether no further events follow until the caller acts.
    pub fn ends_stream(&self) -> bool {
        matches!(
            self,
            Event::StreamStopped { .. } | Event::ToolCallConfirmation { .. }
        )
    }
}

// ── Handlers ───────────────────────────────────────────────────────

/// Observer for runtime events.
///
/// Handlers are called synchronously from the run's task, so they should be
/// quick. The default implementation ignores every event.
///
/// # Example
///
/// ```ignore
/// struct Printer;
///
/// impl EventHandler for Printer {
///     fn on_event(&self, event: &Event) {
///         if let Event::AgentChoice { delta, .. } = event {
///             print!("{delta}");
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &Event) {
        let _ = event;
    }
}

/// Ignores all events.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let Event::ToolCall { call, .. } = event {
///         println!("-> {}", call.name());
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&Event) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self.0)(event)
    }
}

/// Dispatches every event to several handlers, in registration order.
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with_if(verbose, TraceHandler)
///     .with_opt(ui.map(UiHandler::new));
/// ```
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &Event) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &Event) {
        match event {
            Event::StreamStarted {
                session_id,
                agent_name,
            } => {
                info!("Stream started: session={session_id}, agent={agent_name}");
            }
            Event::AgentChoice { agent_name, delta } => {
                let preview: String = delta.chars().take(80).collect();
                trace!("[{agent_name}] text delta: {preview}");
            }
            Event::ToolCall { agent_name, call } => {
                debug!("[{agent_name}] executing tool: {}", call.name());
            }
            Event::ToolCallConfirmation { agent_name, call } => {
                info!(
                    "[{agent_name}] confirmation required for tool: {} (call {})",
                    call.name(),
                    call.id
                );
            }
            Event::ToolCallResponse {
                agent_name,
                call,
                result,
            } => {
                debug!(
                    "[{agent_name}] tool {} result: {} bytes{}",
                    call.name(),
                    result.output.len(),
                    if result.is_error { " (error)" } else { "" }
                );
            }
            Event::Error { agent_name, error } => {
                warn!(
                    "Run failed{}: {error}",
                    agent_name
                        .as_deref()
                        .map(|a| format!(" in agent {a}"))
                        .unwrap_or_default()
                );
            }
            Event::StreamStopped {
                session_id,
                agent_name,
            } => {
                info!("Stream stopped: session={session_id}, agent={agent_name}");
            }
        }
    }
}

// ── Sink ───────────────────────────────────────────────────────────

/// Producer side of a run's events: the handler, the optional channel and
/// the run's cancellation token.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<Event>>,
    handler: Arc<dyn EventHandler>,
    token: CancellationToken,
}

impl EventSink {
    /// A sink that only feeds the handler.
    pub(crate) fn handler_only(handler: Arc<dyn EventHandler>, token: CancellationToken) -> Self {
        Self {
            tx: None,
            handler,
            token,
        }
    }

    /// A sink feeding the handler and a bounded channel, plus the consumer
    /// end of that channel.
    pub(crate) fn channel(
        handler: Arc<dyn EventHandler>,
        token: CancellationToken,
        capacity: usize,
    ) -> (Self, EventStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stream = EventStream {
            inner: ReceiverStream::new(rx),
            token: token.clone(),
        };
        (
            Self {
                tx: Some(tx),
                handler,
                token,
            },
            stream,
        )
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    /// Deliver an event, waiting for channel capacity.
    ///
    /// Fails with [`RuntimeError::Cancelled`] once the run is cancelled or
    /// the consumer is gone; a vanished consumer also cancels the token.
    pub(crate) async fn emit(&self, event: Event) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        self.handler.on_event(&event);
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(RuntimeError::Cancelled),
            sent = tx.send(event) => sent.map_err(|_| {
                debug!("Event consumer dropped, cancelling run");
                self.token.cancel();
                RuntimeError::Cancelled
            }),
        }
    }

    /// Deliver a closing event regardless of cancellation.
    ///
    /// Waits for channel capacity only while the run is not cancelled; a
    /// cancelled run never blocks on a consumer that stopped reading. The
    /// event is dropped when the channel is full or closed.
    pub(crate) async fn emit_final(&self, event: Event) {
        self.handler.on_event(&event);
        let Some(tx) = &self.tx else {
            return;
        };
        let permit = if self.token.is_cancelled() {
            tx.try_reserve().ok()
        } else {
            tokio::select! {
                biased;
                permit = tx.reserve() => permit.ok(),
                _ = self.token.cancelled() => tx.try_reserve().ok(),
            }
        };
        match permit {
            Some(permit) => permit.send(event),
            None => debug!("Dropping final event, consumer is not reading"),
        }
    }
}

// ── Stream ─────────────────────────────────────────────────────────

/// Consumer side of a streamed run.
///
/// Yields events until the run stops, fails or suspends for confirmation.
/// After a suspension, events continue on the same stream once
/// [`Runtime::resume`](super::Runtime::resume) is called. Dropping the
/// stream cancels the run.
pub struct EventStream {
    inner: ReceiverStream<Event>,
    token: CancellationToken,
}

impl EventStream {
    /// Next event, or `None` once the producer is finished for good.
    pub async fn recv(&mut self) -> Option<Event> {
        self.inner.next().await
    }

    /// Cancel the run. Events already produced can still be received.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

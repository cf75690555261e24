//! Handing a task to a sub-agent via `transfer_task`.
//!
//! A successful transfer pushes a frame for the target agent. The frame's
//! history starts with the task prompt; the delegate's final text becomes
//! the response to the parent's `transfer_task` call (see
//! [`ActiveRun::complete_child`]). Rejected transfers are answered with an
//! error result and the parent keeps going.

use super::events::{Event, EventSink};
use super::machine::{ActiveRun, Frame, TurnState};
use crate::agent::Agent;
use crate::error::{DelegationError, Result};
use crate::tools::{ToolResult, TransferTaskArgs, member_task_prompt};
use crate::{Message, ToolCall};
use std::sync::Arc;
use tracing::{debug, info};

impl ActiveRun {
    /// Handle the `transfer_task` call at the front of the active batch.
    pub(super) async fn delegate(&mut self, call: ToolCall, sink: &EventSink) -> Result<()> {
        let (args, target) = match self.check_transfer(&call) {
            Ok(checked) => checked,
            Err(err) => {
                debug!("[{}] transfer rejected: {err}", self.run_id);
                self.transition(TurnState::ExecutingTools);
                return self.resolve(&call, ToolResult::error(err.to_string()), sink).await;
            }
        };

        let parent = self.top().agent.name.clone();
        sink.emit(Event::ToolCall {
            agent_name: parent.clone(),
            call: call.clone(),
        })
        .await?;

        let frame = self.top_mut();
        if frame.batch.front().is_some_and(|c| c.id == call.id) {
            frame.batch.pop_front();
        } else {
            frame.batch.retain(|c| c.id != call.id);
        }

        let frame_id = self.session().next_frame_id();
        self.session().record(
            Message::user(member_task_prompt(&args)),
            Some(&target.name),
            frame_id,
        );
        self.stack
            .push(Frame::new(frame_id, Arc::clone(&target), Some(call)));
        info!(
            "Transferring task: {parent} -> {} (depth {})",
            target.name,
            self.stack.len() - 1
        );
        self.transition(TurnState::AwaitingModel);
        Ok(())
    }

    /// Validate a transfer against the team and the current frame stack.
    fn check_transfer(
        &self,
        call: &ToolCall,
    ) -> Result<(TransferTaskArgs, Arc<Agent>), DelegationError> {
        let args = TransferTaskArgs::parse(call.arguments())?;
        let agent = &self.top().agent;

        let Some(target) = self.team.get(&args.agent).cloned() else {
            return Err(DelegationError::UnknownAgent(args.agent));
        };
        if !agent.can_delegate_to(&args.agent) {
            return Err(DelegationError::NotSubAgent {
                agent: agent.name.clone(),
                target: args.agent,
                available: agent.sub_agents.join(", "),
            });
        }
        if self.stack.iter().any(|f| f.agent.name == args.agent) {
            let mut chain: Vec<&str> = self.stack.iter().map(|f| f.agent.name.as_str()).collect();
            chain.push(&args.agent);
            return Err(DelegationError::Cycle {
                chain: chain.join(" -> "),
                target: args.agent,
            });
        }
        // The root frame is not a delegation.
        let depth = self.stack.len() - 1;
        if depth >= self.config.max_delegation_depth {
            return Err(DelegationError::DepthExceeded {
                max: self.config.max_delegation_depth,
            });
        }
        Ok((args, target))
    }
}

//! Agents and teams.
//!
//! An [`Agent`] bundles a model, an instruction, a toolset and the names of
//! the sub-agents it may delegate to. A [`Team`] is the validated set of
//! agents a [`Runtime`](crate::runtime::Runtime) drives, with one root.
//!
//! ```ignore
//! let researcher = Agent::new("researcher", model.clone())
//!     .with_description("Looks things up")
//!     .with_tools(ToolSet::new().with(search));
//!
//! let root = Agent::new("root", model)
//!     .with_instruction("Answer the user. Delegate research.")
//!     .with_sub_agents(["researcher"])
//!     .with_max_iterations(20);
//!
//! let team = Team::new("root", vec![root, researcher])?;
//! ```

pub mod prompt;
pub mod team;

pub use prompt::{build_request, trim_history};
pub use team::Team;

use crate::provider::ModelProvider;
use crate::tools::ToolSet;
use std::fmt;
use std::sync::Arc;

/// Default turn limit per agent frame.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// A model-backed participant in a team.
#[derive(Clone)]
pub struct Agent {
    /// Unique within a team.
    pub name: String,
    /// Shown to parent agents in the multi-agent preamble.
    pub description: String,
    /// System instruction.
    pub instruction: String,
    pub model: Arc<dyn ModelProvider>,
    pub tools: Arc<ToolSet>,
    /// Agents this one may hand tasks to with `transfer_task`.
    pub sub_agents: Vec<String>,
    /// Model turns allowed per frame. `0` means unlimited.
    pub max_iterations: u32,
    /// Keep only the most recent N non-system messages in each request.
    pub num_history_items: Option<usize>,
    /// Append today's date to the system instruction.
    pub add_date: bool,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model.model_id())
            .field("tools", &self.tools.len())
            .field("sub_agents", &self.sub_agents)
            .field("max_iterations", &self.max_iterations)
            .finish_non_exhaustive()
    }
}

impl Agent {
    pub fn new(name: impl Into<String>, model: Arc<dyn ModelProvider>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: String::new(),
            model,
            tools: Arc::new(ToolSet::new()),
            sub_agents: Vec::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            num_history_items: None,
            add_date: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    /// Share a toolset between agents.
    pub fn with_shared_tools(mut self, tools: Arc<ToolSet>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_sub_agents<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_agents = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_history_limit(mut self, items: usize) -> Self {
        self.num_history_items = Some(items);
        self
    }

    pub fn with_date(mut self, enabled: bool) -> Self {
        self.add_date = enabled;
        self
    }

    pub fn has_sub_agents(&self) -> bool {
        !self.sub_agents.is_empty()
    }

    pub fn can_delegate_to(&self, name: &str) -> bool {
        self.sub_agents.iter().any(|s| s == name)
    }

    /// Whether `turns` model calls have used up this agent's budget.
    pub fn turn_limit_reached(&self, turns: u32) -> bool {
        self.max_iterations > 0 && turns >= self.max_iterations
    }
}

//! A validated set of agents with one root.

use super::Agent;
use crate::error::TeamError;
use crate::tools::{Permissions, PermissionsConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Agents keyed by name, plus team-wide tool permissions.
///
/// Construction checks that the root exists, names are unique and every
/// sub-agent reference resolves.
#[derive(Debug, Clone)]
pub struct Team {
    root: Arc<Agent>,
    agents: BTreeMap<String, Arc<Agent>>,
    permissions: Permissions,
}

impl Team {
    pub fn new(root: impl Into<String>, agents: Vec<Agent>) -> Result<Self, TeamError> {
        let root = root.into();
        if agents.is_empty() {
            return Err(TeamError::Empty);
        }

        let mut map = BTreeMap::new();
        for agent in agents {
            if map.contains_key(&agent.name) {
                return Err(TeamError::DuplicateAgent(agent.name));
            }
            map.insert(agent.name.clone(), Arc::new(agent));
        }
        let Some(root_agent) = map.get(&root).cloned() else {
            return Err(TeamError::MissingRoot(root));
        };
        for agent in map.values() {
            if let Some(missing) = agent.sub_agents.iter().find(|s| !map.contains_key(*s)) {
                return Err(TeamError::UnknownSubAgent {
                    agent: agent.name.clone(),
                    sub_agent: missing.clone(),
                });
            }
        }

        debug!(
            "Team assembled: root={root}, agents=[{}]",
            map.keys().cloned().collect::<Vec<_>>().join(", ")
        );
        Ok(Self {
            root: root_agent,
            agents: map,
            permissions: Permissions::default(),
        })
    }

    /// A team of one. The agent's sub-agent list is cleared since there is
    /// nobody to delegate to.
    pub fn single(mut agent: Agent) -> Self {
        agent.sub_agents.clear();
        let root = Arc::new(agent);
        let mut agents = BTreeMap::new();
        agents.insert(root.name.clone(), Arc::clone(&root));
        Self {
            root,
            agents,
            permissions: Permissions::default(),
        }
    }

    pub fn with_permissions(mut self, config: &PermissionsConfig) -> Result<Self, TeamError> {
        self.permissions = Permissions::compile(config)?;
        Ok(self)
    }

    pub fn root(&self) -> &Arc<Agent> {
        &self.root
    }

    pub fn root_name(&self) -> &str {
        &self.root.name
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<Agent>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn permissions(&self) -> &Permissions {
        &self.permissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ScriptedProvider;
    use crate::tools::PermissionDecision;

    fn agent(name: &str) -> Agent {
        Agent::new(name, Arc::new(ScriptedProvider::new("m")))
    }

    #[test]
    fn valid_team() {
        let team = Team::new(
            "root",
            vec![agent("root").with_sub_agents(["helper"]), agent("helper")],
        )
        .unwrap();
        assert_eq!(team.root().name, "root");
        assert_eq!(team.len(), 2);
        assert!(team.contains("helper"));
    }

    #[test]
    fn rejects_bad_wiring() {
        assert!(matches!(Team::new("root", vec![]), Err(TeamError::Empty)));
        assert!(matches!(
            Team::new("root", vec![agent("other")]),
            Err(TeamError::MissingRoot(name)) if name == "root"
        ));
        assert!(matches!(
            Team::new("root", vec![agent("root"), agent("root")]),
            Err(TeamError::DuplicateAgent(_))
        ));
        assert!(matches!(
            Team::new("root", vec![agent("root").with_sub_agents(["ghost"])]),
            Err(TeamError::UnknownSubAgent { sub_agent, .. }) if sub_agent == "ghost"
        ));
    }

    #[test]
    fn single_drops_dangling_sub_agents() {
        let team = Team::single(agent("solo").with_sub_agents(["ghost"]));
        assert_eq!(team.root_name(), "solo");
        assert!(!team.root().has_sub_agents());
    }

    #[test]
    fn permissions_compile_with_team() {
        let team = Team::single(agent("solo"))
            .with_permissions(&PermissionsConfig::default().deny("rm*"))
            .unwrap();
        assert_eq!(team.permissions().check("rm_rf", None), PermissionDecision::Deny);
    }
}

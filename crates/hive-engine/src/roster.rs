//! Agent roster: role and group resolution over the fixed pane set.
//!
//! The router and recovery manager address agents by role or group name;
//! nothing in the engine holds a process reference — panes are always
//! reached through the daemon by `PaneId`.

use std::collections::HashMap;

use hive_protocol::{PaneId, Role};

use crate::config::{AgentConfig, GroupConfig};
use crate::errors::EngineError;

/// The broadcast mailbox name. Messages to it reach every agent and skip
/// sequence tracking.
pub const BROADCAST: &str = "all";

#[derive(Debug, Clone)]
pub struct Roster {
    agents: Vec<AgentConfig>,
    by_role: HashMap<Role, usize>,
    by_pane: HashMap<PaneId, usize>,
    groups: HashMap<String, Vec<Role>>,
}

impl Roster {
    pub fn new(agents: Vec<AgentConfig>, groups: Vec<GroupConfig>) -> Self {
        let by_role = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.role.clone(), i))
            .collect();
        let by_pane = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.pane_id, i))
            .collect();
        let groups = groups.into_iter().map(|g| (g.name, g.members)).collect();
        Self {
            agents,
            by_role,
            by_pane,
            groups,
        }
    }

    pub fn agent(&self, role: &str) -> Option<&AgentConfig> {
        self.by_role.get(role).map(|&i| &self.agents[i])
    }

    pub fn agent_for_pane(&self, pane_id: PaneId) -> Option<&AgentConfig> {
        self.by_pane.get(&pane_id).map(|&i| &self.agents[i])
    }

    pub fn agents(&self) -> &[AgentConfig] {
        &self.agents
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Whether this recipient name skips sequence tracking.
    pub fn is_broadcast(&self, recipient: &str) -> bool {
        recipient == BROADCAST
    }

    /// Map a recipient name (role, group, or `all`) to concrete agents.
    ///
    /// Unknown recipients are an error — the router surfaces them rather
    /// than dropping messages silently.
    pub fn resolve(&self, recipient: &str) -> Result<Vec<&AgentConfig>, EngineError> {
        if recipient == BROADCAST {
            return Ok(self.agents.iter().collect());
        }
        if let Some(members) = self.groups.get(recipient) {
            return members
                .iter()
                .map(|role| {
                    self.agent(role)
                        .ok_or_else(|| EngineError::UnknownRecipient(role.clone()))
                })
                .collect();
        }
        match self.agent(recipient) {
            Some(agent) => Ok(vec![agent]),
            None => Err(EngineError::UnknownRecipient(Role::new(recipient))),
        }
    }
}

use crate::prelude::{AgentIdx, Day, EntityId};
use getset::CopyGetters;

/// A named grouping of agents (household, ward, workplace...). Membership
/// is maintained from both sides by the entity events.
#[derive(Debug, Clone, CopyGetters)]
pub struct Entity {
    #[getset(get_copy = "pub")]
    id: EntityId,
    name: String,
    agents: Vec<AgentIdx>,

    /// Day of the last membership change.
    #[getset(get_copy = "pub")]
    date_last_modified: Day,
}

impl Entity {
    pub(crate) fn new(id: EntityId, name: impl Into<String>) -> Self {
        Entity {
            id,
            name: name.into(),
            agents: Vec::new(),
            date_last_modified: -99,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current members, in no particular order (removal swaps with the
    /// last member).
    pub fn agents(&self) -> &[AgentIdx] {
        &self.agents
    }

    pub fn n_agents(&self) -> usize {
        self.agents.len()
    }

    pub(crate) fn push_agent(&mut self, agent: AgentIdx, day: Day) {
        self.agents.push(agent);
        self.date_last_modified = day;
    }

    pub(crate) fn remove_agent(&mut self, agent: AgentIdx, day: Day) -> bool {
        match self.agents.iter().position(|&a| a == agent) {
            Some(pos) => {
                self.agents.swap_remove(pos);
                self.date_last_modified = day;
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.agents.clear();
        self.date_last_modified = -99;
    }
}

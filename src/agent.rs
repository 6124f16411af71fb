use crate::event::EventHandler;
use crate::model::ModelView;
use crate::prelude::{AgentIdx, EntityId, Real, StateCode};
use crate::tool::{Mixers, Tool};
use crate::virus::Virus;
use getset::CopyGetters;
use std::fmt;

/// An individual simulated actor. Agents live in the model's dense
/// population vector and refer to each other by index, so the
/// agent/virus/neighbor relations carry no owning cycles.
#[derive(Clone, Default, CopyGetters)]
pub struct Agent {
    /// Stable external id (the node id of the input graph).
    #[getset(get_copy = "pub")]
    id: usize,

    /// Dense position in the population vector.
    #[getset(get_copy = "pub")]
    index: AgentIdx,

    #[getset(get_copy = "pub")]
    state: StateCode,

    viruses: Vec<Virus>,
    tools: Vec<Tool>,
    neighbors: Vec<AgentIdx>,
    entities: Vec<EntityId>,

    pub(crate) on_add_virus: Option<EventHandler>,
    pub(crate) on_rm_virus: Option<EventHandler>,
    pub(crate) on_add_tool: Option<EventHandler>,
    pub(crate) on_rm_tool: Option<EventHandler>,
}

impl Agent {
    pub fn new(index: AgentIdx) -> Self {
        Agent {
            id: index,
            index,
            ..Default::default()
        }
    }

    pub(crate) fn set_id(&mut self, id: usize) {
        self.id = id;
    }

    pub(crate) fn set_index(&mut self, index: AgentIdx) {
        self.index = index;
    }

    pub(crate) fn set_state(&mut self, state: StateCode) {
        self.state = state;
    }

    /// Drop carried viruses, tools and entity memberships and return to
    /// `state`. The neighborhood is left alone.
    pub(crate) fn reset(&mut self, state: StateCode) {
        self.viruses.clear();
        self.tools.clear();
        self.entities.clear();
        self.state = state;
    }

    pub fn viruses(&self) -> &[Virus] {
        &self.viruses
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn neighbors(&self) -> &[AgentIdx] {
        &self.neighbors
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn n_viruses(&self) -> usize {
        self.viruses.len()
    }

    pub fn n_tools(&self) -> usize {
        self.tools.len()
    }

    pub(crate) fn viruses_mut(&mut self) -> &mut Vec<Virus> {
        &mut self.viruses
    }

    pub(crate) fn tools_mut(&mut self) -> &mut Vec<Tool> {
        &mut self.tools
    }

    pub(crate) fn entities_mut(&mut self) -> &mut Vec<EntityId> {
        &mut self.entities
    }

    pub(crate) fn neighbors_mut(&mut self) -> &mut Vec<AgentIdx> {
        &mut self.neighbors
    }

    /// Append `other` to the neighbor list. With `check` the link is
    /// deduplicated. Symmetry is the caller's business: the model's
    /// `connect` keeps undirected graphs mirrored.
    pub fn add_neighbor(&mut self, other: AgentIdx, check: bool) -> bool {
        if check && self.neighbors.contains(&other) {
            return false;
        }
        self.neighbors.push(other);
        true
    }

    pub(crate) fn push_neighbor(&mut self, other: AgentIdx) {
        self.neighbors.push(other);
    }

    pub fn has_virus(&self, name: &str) -> bool {
        self.viruses.iter().any(|v| v.name() == name)
    }

    pub fn has_virus_id(&self, id: usize) -> bool {
        self.viruses.iter().any(|v| v.id() == Some(id))
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub fn has_tool_id(&self, id: usize) -> bool {
        self.tools.iter().any(|t| t.id() == Some(id))
    }

    /// Effective shielding against `virus`, mixing every held tool's
    /// susceptibility channel.
    pub fn susceptibility_reduction(
        &self,
        virus: &Virus,
        view: &ModelView,
        mixers: &Mixers,
    ) -> Real {
        if self.tools.is_empty() {
            return 0.0;
        }
        let values: Vec<Real> = self
            .tools
            .iter()
            .map(|t| t.get_susceptibility_reduction(self, virus, view))
            .collect();
        (mixers.susceptibility)(&values)
    }

    /// Effective damping of outgoing transmission of `virus`.
    pub fn transmission_reduction(
        &self,
        virus: &Virus,
        view: &ModelView,
        mixers: &Mixers,
    ) -> Real {
        if self.tools.is_empty() {
            return 0.0;
        }
        let values: Vec<Real> = self
            .tools
            .iter()
            .map(|t| t.get_transmission_reduction(self, virus, view))
            .collect();
        (mixers.transmission)(&values)
    }

    /// Effective boost to clearing `virus`.
    pub fn recovery_enhancer(&self, virus: &Virus, view: &ModelView, mixers: &Mixers) -> Real {
        if self.tools.is_empty() {
            return 0.0;
        }
        let values: Vec<Real> = self
            .tools
            .iter()
            .map(|t| t.get_recovery_enhancer(self, virus, view))
            .collect();
        (mixers.recovery)(&values)
    }

    /// Effective protection against dying of `virus`.
    pub fn death_reduction(&self, virus: &Virus, view: &ModelView, mixers: &Mixers) -> Real {
        if self.tools.is_empty() {
            return 0.0;
        }
        let values: Vec<Real> = self
            .tools
            .iter()
            .map(|t| t.get_death_reduction(self, virus, view))
            .collect();
        (mixers.death)(&values)
    }

    /// Replace the default apply handler for add-virus events that target
    /// this agent. The other three overrides work the same way.
    pub fn set_on_add_virus(&mut self, handler: EventHandler) -> &mut Self {
        self.on_add_virus = Some(handler);
        self
    }

    pub fn set_on_rm_virus(&mut self, handler: EventHandler) -> &mut Self {
        self.on_rm_virus = Some(handler);
        self
    }

    pub fn set_on_add_tool(&mut self, handler: EventHandler) -> &mut Self {
        self.on_add_tool = Some(handler);
        self
    }

    pub fn set_on_rm_tool(&mut self, handler: EventHandler) -> &mut Self {
        self.on_rm_tool = Some(handler);
        self
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("state", &self.state)
            .field("n_viruses", &self.viruses.len())
            .field("n_tools", &self.tools.len())
            .field("n_neighbors", &self.neighbors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::collections::BTreeMap;

    #[test]
    fn neighbor_dedup() {
        let mut a = Agent::new(0);
        assert!(a.add_neighbor(1, true));
        assert!(!a.add_neighbor(1, true));
        assert!(a.add_neighbor(1, false));
        assert_eq!(a.neighbors(), &[1, 1]);
    }

    #[test]
    fn tool_queries() {
        let mut a = Agent::new(0);
        a.tools_mut().push(Tool::new("mask"));
        assert!(a.has_tool("mask"));
        assert!(!a.has_tool("vaccine"));
    }

    #[test]
    fn reductions_mix_over_tools() {
        let mut a = Agent::new(0);
        let mut m1 = Tool::new("mask");
        m1.set_susceptibility_reduction(0.5).unwrap();
        let mut m2 = Tool::new("vaccine");
        m2.set_susceptibility_reduction(0.5).unwrap();
        a.tools_mut().push(m1);
        a.tools_mut().push(m2);

        let params = BTreeMap::new();
        let view = ModelView { day: 0, params: &params };
        let virus = Virus::new("flu");
        let r = a.susceptibility_reduction(&virus, &view, &Mixers::default());
        assert_approx_eq!(r, 0.75, 1e-12);
        // No tool touches transmission, so the channel stays neutral.
        assert_approx_eq!(a.transmission_reduction(&virus, &view, &Mixers::default()), 0.0, 1e-12);
    }

    #[test]
    fn reset_clears_cargo_keeps_network() {
        let mut a = Agent::new(3);
        a.push_neighbor(1);
        a.viruses_mut().push(Virus::new("flu"));
        a.tools_mut().push(Tool::new("mask"));
        a.reset(0);
        assert_eq!(a.n_viruses(), 0);
        assert_eq!(a.n_tools(), 0);
        assert_eq!(a.neighbors(), &[1]);
    }
}

use crate::agent::Agent;
use crate::database::Database;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::prelude::{AgentIdx, Day, EntityId, StateCode};
use crate::queue::queue_values;
use crate::tool::Tool;
use crate::virus::Virus;
use std::sync::Arc;

/// What a deferred event does to its target agent.
#[derive(Debug, Clone)]
pub enum EventKind {
    AddVirus { virus: Virus },
    RmVirus { pos: usize },
    AddTool { tool: Tool },
    RmTool { pos: usize },
    AddEntity { entity: EntityId },
    RmEntity { entity: EntityId },
    ChangeState,
}

/// A deferred mutation of one agent, produced during the scan phase and
/// consumed exactly once in the apply phase. `new_state`/`queue` are
/// caller overrides; `None` defers to the virus/tool configuration and
/// then to the kind's default (the coalescing rule).
#[derive(Debug, Clone)]
pub struct Event {
    pub agent: AgentIdx,
    pub kind: EventKind,
    pub new_state: Option<StateCode>,
    pub queue: Option<i32>,
}

impl Event {
    pub fn new(agent: AgentIdx, kind: EventKind) -> Self {
        Event {
            agent,
            kind,
            new_state: None,
            queue: None,
        }
    }

    pub fn add_virus(agent: AgentIdx, virus: Virus) -> Self {
        Event::new(agent, EventKind::AddVirus { virus })
    }

    pub fn rm_virus(agent: AgentIdx, pos: usize) -> Self {
        Event::new(agent, EventKind::RmVirus { pos })
    }

    pub fn add_tool(agent: AgentIdx, tool: Tool) -> Self {
        Event::new(agent, EventKind::AddTool { tool })
    }

    pub fn rm_tool(agent: AgentIdx, pos: usize) -> Self {
        Event::new(agent, EventKind::RmTool { pos })
    }

    pub fn change_state(agent: AgentIdx, new_state: StateCode, queue: i32) -> Self {
        let mut ev = Event::new(agent, EventKind::ChangeState);
        ev.new_state = Some(new_state);
        ev.queue = Some(queue);
        ev
    }

    pub fn with_state(mut self, state: Option<StateCode>) -> Self {
        self.new_state = state;
        self
    }

    pub fn with_queue(mut self, queue: Option<i32>) -> Self {
        self.queue = queue;
        self
    }

    /// Resolve the effective `(new_state, queue_delta)` for this event
    /// against the target agent: the caller's override wins, then the
    /// virus/tool configuration, then the kind's baseline (viruses move
    /// whole neighborhoods in and out of the queue; tools and entities
    /// move nobody).
    pub fn coalesce(&self, agent: &Agent) -> Result<(Option<StateCode>, i32)> {
        let (cfg_state, cfg_queue, fallback) = match &self.kind {
            EventKind::AddVirus { virus } => (
                virus.state_init(),
                virus.queue_init(),
                queue_values::EVERYONE,
            ),
            EventKind::RmVirus { pos } => {
                let virus = agent.viruses().get(*pos).ok_or_else(|| {
                    Error::out_of_range(format!(
                        "virus position {} of agent {} (has {})",
                        pos,
                        agent.index(),
                        agent.n_viruses()
                    ))
                })?;
                (
                    virus.state_post(),
                    virus.queue_post(),
                    -queue_values::EVERYONE,
                )
            }
            EventKind::AddTool { tool } => {
                (tool.state_init(), tool.queue_init(), queue_values::NO_ONE)
            }
            EventKind::RmTool { pos } => {
                let tool = agent.tools().get(*pos).ok_or_else(|| {
                    Error::out_of_range(format!(
                        "tool position {} of agent {} (has {})",
                        pos,
                        agent.index(),
                        agent.n_tools()
                    ))
                })?;
                (tool.state_post(), tool.queue_post(), queue_values::NO_ONE)
            }
            EventKind::AddEntity { .. } | EventKind::RmEntity { .. } | EventKind::ChangeState => {
                (None, None, queue_values::NO_ONE)
            }
        };

        let state = self.new_state.or(cfg_state);
        let queue = self.queue.or(cfg_queue).unwrap_or(fallback);
        Ok((state, queue))
    }
}

/// FIFO buffer of pending events. Strictly append-only between step
/// phases; the apply loop walks it by index so handlers may enqueue
/// follow-up events within the same drain.
#[derive(Debug, Clone, Default)]
pub struct Events {
    buf: Vec<Event>,
}

impl Events {
    pub fn push(&mut self, ev: Event) {
        self.buf.push(ev);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub(crate) fn get(&self, i: usize) -> Option<&Event> {
        self.buf.get(i)
    }

    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Context handed to apply handlers. `prev_state` is the agent's state
/// when the event was popped; `new_state` the coalesced target (`None`
/// keeps the current state).
pub struct ApplyCtx<'a> {
    pub day: Day,
    pub prev_state: StateCode,
    pub new_state: Option<StateCode>,
    pub db: &'a mut Database,
    pub events: &'a mut Events,
    pub entities: &'a mut [Entity],
}

/// Per-agent override for one of the default apply handlers.
pub type EventHandler =
    Arc<dyn Fn(&mut Agent, &Event, &mut ApplyCtx) -> Result<()> + Send + Sync>;

/// Default add-virus handler: records the transmission when the incoming
/// instance had a (different) host, clones it into the target's list and
/// counts it at the target's pre-event state. The generic state-change
/// pass moves all carried viruses to the new state afterwards.
pub fn default_add_virus(agent: &mut Agent, event: &Event, ctx: &mut ApplyCtx) -> Result<()> {
    let virus = match &event.kind {
        EventKind::AddVirus { virus } => virus,
        _ => return Err(Error::invalid("add-virus handler on a different event")),
    };
    let id = virus
        .id()
        .ok_or_else(|| Error::unknown(format!("virus {:?} not registered", virus.name())))?;

    if let Some(source) = virus.host() {
        if source != agent.index() {
            ctx.db
                .record_transmission(ctx.day, id, source, agent.index());
        }
    }

    let mut incoming = virus.clone();
    incoming.set_host(Some(agent.index()));
    incoming.set_date(ctx.day);
    agent.viruses_mut().push(incoming);

    ctx.db.variant_delta(id, ctx.prev_state, 1)?;
    Ok(())
}

/// Default rm-virus handler: fires the post-recovery hook, removes by
/// swapping with the last entry and discounts the instance at the state
/// it was carried in.
pub fn default_rm_virus(agent: &mut Agent, event: &Event, ctx: &mut ApplyCtx) -> Result<()> {
    let pos = match &event.kind {
        EventKind::RmVirus { pos } => *pos,
        _ => return Err(Error::invalid("rm-virus handler on a different event")),
    };
    if pos >= agent.n_viruses() {
        return Err(Error::out_of_range(format!(
            "virus position {} of agent {} (has {})",
            pos,
            agent.index(),
            agent.n_viruses()
        )));
    }

    let virus = agent.viruses_mut().swap_remove(pos);
    if let Some(fun) = virus.post_recovery() {
        fun(agent.index(), &virus, ctx.events);
    }

    let id = virus
        .id()
        .ok_or_else(|| Error::unknown(format!("virus {:?} not registered", virus.name())))?;
    ctx.db.variant_delta(id, ctx.prev_state, -1)?;
    Ok(())
}

/// Default add-tool handler; no transmission record, no variant counts.
pub fn default_add_tool(agent: &mut Agent, event: &Event, ctx: &mut ApplyCtx) -> Result<()> {
    let tool = match &event.kind {
        EventKind::AddTool { tool } => tool,
        _ => return Err(Error::invalid("add-tool handler on a different event")),
    };
    let mut incoming = tool.clone();
    incoming.set_agent(Some(agent.index()));
    incoming.set_date(ctx.day);
    agent.tools_mut().push(incoming);
    Ok(())
}

/// Default rm-tool handler; swap-with-last keeps the list contiguous.
pub fn default_rm_tool(agent: &mut Agent, event: &Event, _ctx: &mut ApplyCtx) -> Result<()> {
    let pos = match &event.kind {
        EventKind::RmTool { pos } => *pos,
        _ => return Err(Error::invalid("rm-tool handler on a different event")),
    };
    if pos >= agent.n_tools() {
        return Err(Error::out_of_range(format!(
            "tool position {} of agent {} (has {})",
            pos,
            agent.index(),
            agent.n_tools()
        )));
    }
    agent.tools_mut().swap_remove(pos);
    Ok(())
}

/// Default add-entity handler: links both sides of the relation.
pub fn default_add_entity(agent: &mut Agent, event: &Event, ctx: &mut ApplyCtx) -> Result<()> {
    let entity = match &event.kind {
        EventKind::AddEntity { entity } => *entity,
        _ => return Err(Error::invalid("add-entity handler on a different event")),
    };
    let e = ctx
        .entities
        .get_mut(entity)
        .ok_or_else(|| Error::unknown(format!("entity {} not registered", entity)))?;
    if agent.entities().contains(&entity) {
        return Ok(()); // already a member
    }
    agent.entities_mut().push(entity);
    e.push_agent(agent.index(), ctx.day);
    Ok(())
}

/// Default rm-entity handler: unlinks both sides, swap-with-last.
pub fn default_rm_entity(agent: &mut Agent, event: &Event, ctx: &mut ApplyCtx) -> Result<()> {
    let entity = match &event.kind {
        EventKind::RmEntity { entity } => *entity,
        _ => return Err(Error::invalid("rm-entity handler on a different event")),
    };
    let e = ctx
        .entities
        .get_mut(entity)
        .ok_or_else(|| Error::unknown(format!("entity {} not registered", entity)))?;

    let pos = agent
        .entities()
        .iter()
        .position(|&x| x == entity)
        .ok_or_else(|| {
            Error::ownership(format!(
                "agent {} is not a member of entity {}",
                agent.index(),
                entity
            ))
        })?;
    agent.entities_mut().swap_remove(pos);
    if !e.remove_agent(agent.index(), ctx.day) {
        return Err(Error::ownership(format!(
            "entity {} does not list agent {}",
            entity,
            agent.index()
        )));
    }
    Ok(())
}

use crate::error::{Error, Result};
use crate::model::AgentCtx;
use crate::queue::queue_values;

/// Default update for susceptible states: roulette over every virus
/// carried in the neighborhood, weighted by the virus's infectiousness
/// and both agents' tool reductions. On a hit the picked virus is
/// enqueued onto this agent.
pub fn default_update_susceptible(ctx: &mut AgentCtx) -> Result<()> {
    if ctx.agent().n_viruses() > 0 {
        return Err(Error::invalid(format!(
            "susceptible update on agent {} which carries {} viruses",
            ctx.index(),
            ctx.agent().n_viruses()
        )));
    }

    let idx = ctx.index();
    if let Some((neighbor, pos)) = ctx.model_mut().pick_transmission(idx)? {
        let virus = ctx.model().population()[neighbor].viruses()[pos].clone();
        ctx.add_virus(virus, None, None)?;
    }
    Ok(())
}

/// Default update for exposed states: every carried virus competes with a
/// death chance and a recovery chance (even and odd roulette slots). A
/// death applies the virus's removed-state configuration; a recovery
/// removes the virus.
pub fn default_update_exposed(ctx: &mut AgentCtx) -> Result<()> {
    if ctx.agent().n_viruses() == 0 {
        return Err(Error::invalid(format!(
            "exposed update on agent {} which carries no virus",
            ctx.index()
        )));
    }

    let idx = ctx.index();
    let which = match ctx.model_mut().pick_exposed_event(idx)? {
        Some(which) => which,
        None => return Ok(()),
    };

    let pos = which / 2;
    if which % 2 == 0 {
        // Death: the virus's removed triplet decides where the agent
        // goes; by default the whole neighborhood leaves the queue.
        let (state_removed, queue_removed) = {
            let virus = &ctx.agent().viruses()[pos];
            (virus.state_removed(), virus.queue_removed())
        };
        let new_state = state_removed.unwrap_or_else(|| ctx.agent().state());
        let queue = queue_removed.unwrap_or(-queue_values::EVERYONE);
        ctx.change_state(new_state, queue)
    } else {
        ctx.rm_virus(pos, None, None)
    }
}

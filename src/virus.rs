use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::event::{Event, Events};
use crate::model::ModelView;
use crate::prelude::{AgentIdx, Day, Real, StateCode, VariantId};
use crate::tool::Tool;
use getset::CopyGetters;
use rand::rngs::SmallRng;
use std::fmt;
use std::sync::Arc;

/// Baseline probabilities used when a virus declares no hook and no
/// constant for the corresponding channel.
pub const DEFAULT_PROB_INFECTING: Real = 1.0;
pub const DEFAULT_PROB_RECOVERY: Real = 0.5;
pub const DEFAULT_PROB_DEATH: Real = 0.0;

/// Hook returning a probability for a (host, virus, model) triple.
pub type VirusFun = Arc<dyn Fn(&Agent, &Virus, &ModelView) -> Real + Send + Sync>;

/// Mutation hook; returns true when the sequence changed and the variant
/// must be re-registered with the database.
pub type MutationFun = Arc<dyn Fn(&Agent, &mut Virus, &mut SmallRng) -> bool + Send + Sync>;

/// Side effect fired when the virus leaves its host (e.g. granting an
/// immunity tool). Runs inside the apply phase and may only enqueue
/// further events.
pub type PostRecoveryFun = Arc<dyn Fn(AgentIdx, &Virus, &mut Events) + Send + Sync>;

/// A probability channel: unset (fall back to the engine default), a
/// stored constant, or a user hook. Constants keep the inner loop free of
/// dynamic dispatch.
#[derive(Clone)]
pub enum Rate<F> {
    Unset,
    Const(Real),
    Fun(F),
}

impl<F> Rate<F> {
    pub fn is_set(&self) -> bool {
        !matches!(self, Rate::Unset)
    }
}

impl<F> Default for Rate<F> {
    fn default() -> Self {
        Rate::Unset
    }
}

/// A transmissible pathogen instance. Prototypes are registered on the
/// model; per-agent copies live inline in the agent's virus list and point
/// back to their host by dense index.
#[derive(Clone, Default, CopyGetters)]
pub struct Virus {
    name: String,
    seq: Option<Vec<u8>>,

    /// Variant id; assigned by the database on registration.
    #[getset(get_copy = "pub")]
    id: Option<VariantId>,

    /// Day the infection (or the variant, for prototypes) originated.
    #[getset(get_copy = "pub")]
    date: Day,

    /// Host agent while the instance resides inside one.
    #[getset(get_copy = "pub")]
    host: Option<AgentIdx>,

    prob_infecting: Rate<VirusFun>,
    prob_recovery: Rate<VirusFun>,
    prob_death: Rate<VirusFun>,

    mutation: Option<MutationFun>,
    post_recovery: Option<PostRecoveryFun>,

    state_init: Option<StateCode>,
    state_post: Option<StateCode>,
    state_removed: Option<StateCode>,

    queue_init: Option<i32>,
    queue_post: Option<i32>,
    queue_removed: Option<i32>,
}

impl Virus {
    pub fn new(name: impl Into<String>) -> Self {
        Virus {
            name: name.into(),
            date: -99,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Opaque genetic payload of the variant.
    pub fn seq(&self) -> Option<&[u8]> {
        self.seq.as_deref()
    }

    pub fn set_seq(&mut self, seq: impl Into<Vec<u8>>) -> &mut Self {
        self.seq = Some(seq.into());
        self
    }

    pub(crate) fn set_id(&mut self, id: VariantId) {
        self.id = Some(id);
    }

    // Prototypes re-register on every reset; a stale id would otherwise
    // leak into the new registry as a bogus parent.
    pub(crate) fn clear_id(&mut self) {
        self.id = None;
    }

    pub(crate) fn set_host(&mut self, host: Option<AgentIdx>) {
        self.host = host;
    }

    pub(crate) fn set_date(&mut self, date: Day) {
        self.date = date;
    }

    /// Probability that the virus jumps to a susceptible contact today.
    pub fn prob_infecting(&self, host: &Agent, view: &ModelView) -> Real {
        match &self.prob_infecting {
            Rate::Unset => DEFAULT_PROB_INFECTING,
            Rate::Const(p) => *p,
            Rate::Fun(f) => f(host, self, view),
        }
    }

    /// Probability that the host clears the virus today.
    pub fn prob_recovery(&self, host: &Agent, view: &ModelView) -> Real {
        match &self.prob_recovery {
            Rate::Unset => DEFAULT_PROB_RECOVERY,
            Rate::Const(p) => *p,
            Rate::Fun(f) => f(host, self, view),
        }
    }

    /// Probability that the virus kills the host today.
    pub fn prob_death(&self, host: &Agent, view: &ModelView) -> Real {
        match &self.prob_death {
            Rate::Unset => DEFAULT_PROB_DEATH,
            Rate::Const(p) => *p,
            Rate::Fun(f) => f(host, self, view),
        }
    }

    pub fn set_prob_infecting(&mut self, p: Real) -> Result<&mut Self> {
        self.prob_infecting = Rate::Const(check_prob(p)?);
        Ok(self)
    }

    pub fn set_prob_recovery(&mut self, p: Real) -> Result<&mut Self> {
        self.prob_recovery = Rate::Const(check_prob(p)?);
        Ok(self)
    }

    pub fn set_prob_death(&mut self, p: Real) -> Result<&mut Self> {
        self.prob_death = Rate::Const(check_prob(p)?);
        Ok(self)
    }

    pub fn set_prob_infecting_fun(&mut self, fun: VirusFun) -> &mut Self {
        self.prob_infecting = Rate::Fun(fun);
        self
    }

    pub fn set_prob_recovery_fun(&mut self, fun: VirusFun) -> &mut Self {
        self.prob_recovery = Rate::Fun(fun);
        self
    }

    pub fn set_prob_death_fun(&mut self, fun: VirusFun) -> &mut Self {
        self.prob_death = Rate::Fun(fun);
        self
    }

    pub fn set_mutation(&mut self, fun: MutationFun) -> &mut Self {
        self.mutation = Some(fun);
        self
    }

    pub(crate) fn mutation(&self) -> Option<&MutationFun> {
        self.mutation.as_ref()
    }

    pub fn set_post_recovery(&mut self, fun: PostRecoveryFun) -> &mut Self {
        self.post_recovery = Some(fun);
        self
    }

    pub(crate) fn post_recovery(&self) -> Option<&PostRecoveryFun> {
        self.post_recovery.as_ref()
    }

    /// Install a post-recovery hook that grants the host an immunity tool
    /// whose susceptibility reduction equals `prob`. Fails if a
    /// post-recovery hook is already in place, since composing both would
    /// silently drop one of them.
    pub fn set_post_immunity(&mut self, prob: Real) -> Result<&mut Self> {
        if self.post_recovery.is_some() {
            return Err(Error::invalid(format!(
                "virus {:?} already has a post-recovery hook",
                self.name
            )));
        }
        let mut tool = Tool::new(format!("immunity ({})", self.name));
        tool.set_susceptibility_reduction(prob)?;
        self.post_recovery = Some(Arc::new(move |host, _virus, events: &mut Events| {
            events.push(Event::add_tool(host, tool.clone()));
        }));
        Ok(self)
    }

    /// States the host moves to when the virus is added, removed, and when
    /// it kills the host. `None` keeps the host's current state.
    pub fn set_state(
        &mut self,
        init: Option<StateCode>,
        post: Option<StateCode>,
        removed: Option<StateCode>,
    ) -> &mut Self {
        self.state_init = init;
        self.state_post = post;
        self.state_removed = removed;
        self
    }

    /// Queue deltas paired with [`Virus::set_state`]; see
    /// [`crate::queue::queue_values`].
    pub fn set_queue(
        &mut self,
        init: Option<i32>,
        post: Option<i32>,
        removed: Option<i32>,
    ) -> &mut Self {
        self.queue_init = init;
        self.queue_post = post;
        self.queue_removed = removed;
        self
    }

    pub fn state_init(&self) -> Option<StateCode> {
        self.state_init
    }

    pub fn state_post(&self) -> Option<StateCode> {
        self.state_post
    }

    pub fn state_removed(&self) -> Option<StateCode> {
        self.state_removed
    }

    pub fn queue_init(&self) -> Option<i32> {
        self.queue_init
    }

    pub fn queue_post(&self) -> Option<i32> {
        self.queue_post
    }

    pub fn queue_removed(&self) -> Option<i32> {
        self.queue_removed
    }
}

impl fmt::Debug for Virus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Virus")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("date", &self.date)
            .field("host", &self.host)
            .finish()
    }
}

fn check_prob(p: Real) -> Result<Real> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(Error::invalid(format!("probability {} not in [0, 1]", p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelView;
    use std::collections::BTreeMap;

    fn view(params: &BTreeMap<String, Real>) -> ModelView<'_> {
        ModelView { day: 0, params }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let v = Virus::new("x");
        let host = Agent::new(0);
        let params = BTreeMap::new();
        assert_eq!(v.prob_infecting(&host, &view(&params)), DEFAULT_PROB_INFECTING);
        assert_eq!(v.prob_recovery(&host, &view(&params)), DEFAULT_PROB_RECOVERY);
        assert_eq!(v.prob_death(&host, &view(&params)), DEFAULT_PROB_DEATH);
    }

    #[test]
    fn constants_override_defaults() {
        let mut v = Virus::new("x");
        v.set_prob_infecting(0.3).unwrap();
        let host = Agent::new(0);
        let params = BTreeMap::new();
        assert_eq!(v.prob_infecting(&host, &view(&params)), 0.3);
    }

    #[test]
    fn hook_reads_model_params() {
        let mut v = Virus::new("x");
        v.set_prob_infecting_fun(Arc::new(|_, _, m: &ModelView| {
            m.params.get("beta").copied().unwrap_or(0.0)
        }));
        let host = Agent::new(0);
        let mut params = BTreeMap::new();
        params.insert("beta".to_string(), 0.25);
        assert_eq!(v.prob_infecting(&host, &view(&params)), 0.25);
    }

    #[test]
    fn probability_bounds_are_checked() {
        let mut v = Virus::new("x");
        assert!(v.set_prob_infecting(1.5).is_err());
        assert!(v.set_prob_death(-0.1).is_err());
    }

    #[test]
    fn post_immunity_rejects_double_install() {
        let mut v = Virus::new("x");
        v.set_post_immunity(0.9).unwrap();
        assert!(v.set_post_immunity(0.5).is_err());
    }
}

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::model::ModelView;
use crate::prelude::{AgentIdx, Day, Real, StateCode};
use crate::virus::{Rate, Virus};
use getset::CopyGetters;
use std::fmt;
use std::sync::Arc;

/// Hook returning a reduction multiplier for an (agent, tool, virus,
/// model) tuple.
pub type ToolFun = Arc<dyn Fn(&Agent, &Tool, &Virus, &ModelView) -> Real + Send + Sync>;

/// Combines the per-tool multipliers of one channel into a single
/// effective multiplier.
pub type MixFun = Arc<dyn Fn(&[Real]) -> Real + Send + Sync>;

fn check_prob(p: Real) -> Result<Real> {
    if (0.0..=1.0).contains(&p) {
        Ok(p)
    } else {
        Err(Error::invalid(format!("multiplier {} not in [0, 1]", p)))
    }
}

macro_rules! tool_channel {
    ($(#[$doc:meta])* $name:ident) => {
        paste::paste! {
            $(#[$doc])*
            pub fn [<get_ $name>](
                &self,
                agent: &Agent,
                virus: &Virus,
                view: &ModelView,
            ) -> Real {
                match &self.$name {
                    Rate::Unset => 0.0,
                    Rate::Const(p) => *p,
                    Rate::Fun(f) => f(agent, self, virus, view),
                }
            }

            pub fn [<set_ $name>](&mut self, value: Real) -> Result<&mut Self> {
                self.$name = Rate::Const(check_prob(value)?);
                Ok(self)
            }

            pub fn [<set_ $name _fun>](&mut self, fun: ToolFun) -> &mut Self {
                self.$name = Rate::Fun(fun);
                self
            }
        }
    };
}

/// An intervention (mask, vaccine, acquired immunity, ...) held by an
/// agent. Each channel is a multiplier in `[0, 1]`; unset channels have no
/// effect.
#[derive(Clone, Default, CopyGetters)]
pub struct Tool {
    name: String,

    /// Position in the model's tool registry; `None` for ad-hoc
    /// instances such as post-recovery immunity.
    #[getset(get_copy = "pub")]
    id: Option<usize>,

    #[getset(get_copy = "pub")]
    date: Day,

    /// Owner while the instance resides inside an agent.
    #[getset(get_copy = "pub")]
    agent: Option<AgentIdx>,

    susceptibility_reduction: Rate<ToolFun>,
    transmission_reduction: Rate<ToolFun>,
    recovery_enhancer: Rate<ToolFun>,
    death_reduction: Rate<ToolFun>,

    state_init: Option<StateCode>,
    state_post: Option<StateCode>,
    queue_init: Option<i32>,
    queue_post: Option<i32>,
}

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Tool {
            name: name.into(),
            date: -99,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_agent(&mut self, agent: Option<AgentIdx>) {
        self.agent = agent;
    }

    pub(crate) fn set_id(&mut self, id: usize) {
        self.id = Some(id);
    }

    pub(crate) fn set_date(&mut self, date: Day) {
        self.date = date;
    }

    tool_channel! {
        /// How much the tool shields its owner from incoming viruses.
        susceptibility_reduction
    }

    tool_channel! {
        /// How much the tool dampens the owner's outgoing transmission.
        transmission_reduction
    }

    tool_channel! {
        /// How much the tool speeds up clearing a carried virus.
        recovery_enhancer
    }

    tool_channel! {
        /// How much the tool protects the owner from dying of a virus.
        death_reduction
    }

    /// States the owner moves to when the tool is added and removed;
    /// `None` keeps the current state.
    pub fn set_state(&mut self, init: Option<StateCode>, post: Option<StateCode>) -> &mut Self {
        self.state_init = init;
        self.state_post = post;
        self
    }

    /// Queue deltas paired with [`Tool::set_state`].
    pub fn set_queue(&mut self, init: Option<i32>, post: Option<i32>) -> &mut Self {
        self.queue_init = init;
        self.queue_post = post;
        self
    }

    pub fn state_init(&self) -> Option<StateCode> {
        self.state_init
    }

    pub fn state_post(&self) -> Option<StateCode> {
        self.state_post
    }

    pub fn queue_init(&self) -> Option<i32> {
        self.queue_init
    }

    pub fn queue_post(&self) -> Option<i32> {
        self.queue_post
    }
}

impl fmt::Debug for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("date", &self.date)
            .field("agent", &self.agent)
            .finish()
    }
}

/// The four per-model mixers combining tool multipliers into effective
/// ones. The default for every channel is the complementary product
/// `1 - prod(1 - x_i)`: independent layers of protection.
#[derive(Clone)]
pub struct Mixers {
    pub susceptibility: MixFun,
    pub transmission: MixFun,
    pub recovery: MixFun,
    pub death: MixFun,
}

/// Complementary-product combination of independent multipliers.
pub fn mixer_complement(values: &[Real]) -> Real {
    1.0 - values.iter().fold(1.0, |acc, x| acc * (1.0 - x))
}

impl Default for Mixers {
    fn default() -> Self {
        Mixers {
            susceptibility: Arc::new(mixer_complement),
            transmission: Arc::new(mixer_complement),
            recovery: Arc::new(mixer_complement),
            death: Arc::new(mixer_complement),
        }
    }
}

impl fmt::Debug for Mixers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Mixers {..}")
    }
}

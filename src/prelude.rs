pub use crate::agent::Agent;
pub use crate::database::{Database, SeqCodec};
pub use crate::diagram::ModelDiagram;
pub use crate::entity::Entity;
pub use crate::error::{Error, Result};
pub use crate::event::{Event, EventKind, Events};
pub use crate::graph::{
    rewire_adjlist, rewire_degseq, rgraph_bernoulli, rgraph_ring_lattice, rgraph_smallworld,
    AdjList,
};
pub use crate::lfmcmc::{
    kernel_gaussian, kernel_uniform, make_proposal_norm_reflective, proposal_normal, Lfmcmc,
};
pub use crate::model::{AgentCtx, Model, ModelView, Prevalence, StateKind};
pub use crate::queue::{queue_values, ActiveQueue};
pub use crate::roulette::roulette;
pub use crate::tool::{Mixers, Tool};
pub use crate::update::{default_update_exposed, default_update_susceptible};
pub use crate::userdata::UserData;
pub use crate::virus::Virus;

pub type Real = f64;
pub type Day = i32;

/// Dense position of an agent in the population vector.
pub type AgentIdx = usize;

/// Code of a registered state; dense in `0..model.n_states()`.
pub type StateCode = usize;

/// Id of a variant in the database registry.
pub type VariantId = usize;

/// Id of an entity registered on the model.
pub type EntityId = usize;

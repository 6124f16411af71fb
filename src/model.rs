use crate::agent::Agent;
use crate::database::Database;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::event::{
    default_add_entity, default_add_tool, default_add_virus, default_rm_entity, default_rm_tool,
    default_rm_virus, ApplyCtx, Event, EventKind, Events,
};
use crate::graph::{rewire_degseq, rgraph_smallworld, AdjList};
use crate::prelude::{AgentIdx, Day, EntityId, Real, StateCode};
use crate::progress::Progress;
use crate::queue::{queue_values, ActiveQueue};
use crate::roulette::roulette;
use crate::tool::{Mixers, Tool};
use crate::update::{default_update_exposed, default_update_susceptible};
use crate::virus::Virus;
use getset::CopyGetters;
use log::*;
use rand::prelude::*;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Read-only view of the model handed to virus/tool hooks.
pub struct ModelView<'a> {
    pub day: Day,
    pub params: &'a BTreeMap<String, Real>,
}

/// Partition a state belongs to; the exposed set marks states whose
/// agents carry a transmissible virus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Susceptible,
    Exposed,
    Removed,
}

/// Per-state update function, called once per scanned agent per day.
/// Update functions enqueue events; they never mutate other agents
/// directly.
pub type UpdateFun = Arc<dyn Fn(&mut AgentCtx) -> Result<()> + Send + Sync>;

/// User-scheduled callback run once per step (or on one specific day).
pub type GlobalFun = Arc<dyn Fn(&mut Model) -> Result<()> + Send + Sync>;

/// Network perturbation applied between steps.
pub type RewireFun =
    Arc<dyn Fn(&mut [Agent], bool, Real, &mut SmallRng) -> Result<()> + Send + Sync>;

/// Initial seeding of a virus or tool: a share of the population or an
/// absolute count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prevalence {
    Proportion(Real),
    Count(usize),
}

#[derive(Clone)]
struct StateSet {
    labels: Vec<String>,
    kinds: Vec<StateKind>,
    update: Vec<Option<UpdateFun>>,
}

impl StateSet {
    fn standard() -> Self {
        StateSet {
            labels: vec![
                "susceptible".to_string(),
                "exposed".to_string(),
                "removed".to_string(),
            ],
            kinds: vec![
                StateKind::Susceptible,
                StateKind::Exposed,
                StateKind::Removed,
            ],
            update: vec![
                Some(Arc::new(default_update_susceptible) as UpdateFun),
                Some(Arc::new(default_update_exposed) as UpdateFun),
                None,
            ],
        }
    }

    fn empty() -> Self {
        StateSet {
            labels: vec![],
            kinds: vec![],
            update: vec![],
        }
    }

    fn len(&self) -> usize {
        self.labels.len()
    }

    fn add(&mut self, label: &str, kind: StateKind, update: Option<UpdateFun>) -> Result<StateCode> {
        if self.labels.iter().any(|l| l == label) {
            return Err(Error::invalid(format!("state {:?} already declared", label)));
        }
        self.labels.push(label.to_string());
        self.kinds.push(kind);
        self.update.push(update);
        Ok(self.labels.len() - 1)
    }

    fn is_exposed(&self, code: StateCode) -> bool {
        matches!(self.kinds.get(code), Some(StateKind::Exposed))
    }

    fn first_susceptible(&self) -> StateCode {
        self.kinds
            .iter()
            .position(|k| *k == StateKind::Susceptible)
            .unwrap_or(0)
    }
}

#[derive(Clone)]
struct GlobalAction {
    name: String,
    day: Option<Day>,
    fun: GlobalFun,
}

/// Scratch arrays reused across scan calls; update functions borrow them
/// within a single call and must not keep references across calls.
#[derive(Debug, Clone, Default)]
pub struct Scratch {
    pub probs: Vec<Real>,
    pub candidates: Vec<(AgentIdx, usize)>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Timer {
    last: Option<Duration>,
    total: Duration,
    n_runs: usize,
}

/// The composition root: population, registries, RNG, states, the event
/// pipeline and the database, plus the daily main loop.
#[derive(Clone, CopyGetters)]
pub struct Model {
    population: Vec<Agent>,
    directed: bool,

    viruses: Vec<Virus>,
    virus_prevalence: Vec<Prevalence>,
    tools: Vec<Tool>,
    tool_prevalence: Vec<Prevalence>,
    entities: Vec<Entity>,

    params: BTreeMap<String, Real>,
    states: StateSet,
    mixers: Mixers,

    rng: SmallRng,
    db: Database,
    events: Events,
    queue: ActiveQueue,

    #[getset(get_copy = "pub")]
    use_queuing: bool,

    #[getset(get_copy = "pub")]
    verbose: bool,

    initialized: bool,

    #[getset(get_copy = "pub")]
    today: Day,

    #[getset(get_copy = "pub")]
    ndays: Day,

    rewire: Option<(RewireFun, Real)>,
    global_actions: Vec<GlobalAction>,
    backup: Option<Vec<Agent>>,

    pub(crate) scratch: Scratch,
    timer: Timer,
}

impl Default for Model {
    fn default() -> Self {
        Model::new()
    }
}

impl Model {
    /// A model with the standard susceptible/exposed/removed states and
    /// their default update functions.
    pub fn new() -> Self {
        Model {
            population: Vec::new(),
            directed: false,
            viruses: Vec::new(),
            virus_prevalence: Vec::new(),
            tools: Vec::new(),
            tool_prevalence: Vec::new(),
            entities: Vec::new(),
            params: BTreeMap::new(),
            states: StateSet::standard(),
            mixers: Mixers::default(),
            rng: SmallRng::from_entropy(),
            db: Database::new(1),
            events: Events::default(),
            queue: ActiveQueue::default(),
            use_queuing: true,
            verbose: false,
            initialized: false,
            today: 0,
            ndays: 0,
            rewire: None,
            global_actions: Vec::new(),
            backup: None,
            scratch: Scratch::default(),
            timer: Timer::default(),
        }
    }

    fn check_init(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::Uninitialized)
        }
    }

    /* Population ******************************************************/

    /// Build the population from an adjacency list. Node `i` of the list
    /// becomes agent `i`; external ids keep the list's offset.
    pub fn agents_from_adjlist(&mut self, al: &AdjList) -> Result<&mut Self> {
        let n = al.vcount();
        self.directed = al.is_directed();
        self.population = (0..n).map(Agent::new).collect();
        for i in 0..n {
            self.population[i].set_id(i + al.min_id());
            for (&j, &mult) in al.neighbors(i)? {
                for _ in 0..mult {
                    self.population[i].push_neighbor(j);
                }
            }
        }
        Ok(self)
    }

    /// Build the population from an edgelist file (see
    /// [`AdjList::read_edgelist`]).
    pub fn agents_from_edgelist(
        &mut self,
        path: impl AsRef<Path>,
        skip: usize,
        directed: bool,
        min_id: Option<usize>,
        max_id: Option<usize>,
    ) -> Result<&mut Self> {
        let al = AdjList::read_edgelist(path, skip, directed, min_id, max_id)?;
        self.agents_from_adjlist(&al)
    }

    /// Build the population over a small-world graph.
    pub fn agents_smallworld(
        &mut self,
        n: usize,
        k: usize,
        p: Real,
        directed: bool,
    ) -> Result<&mut Self> {
        let al = rgraph_smallworld(n, k, p, directed, &mut self.rng)?;
        self.agents_from_adjlist(&al)
    }

    pub fn population(&self) -> &[Agent] {
        &self.population
    }

    pub fn size(&self) -> usize {
        self.population.len()
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn agent(&self, i: AgentIdx) -> Result<&Agent> {
        self.population
            .get(i)
            .ok_or_else(|| Error::out_of_range(format!("agent {} of {}", i, self.population.len())))
    }

    /// Link `i -> j`, mirroring for undirected models when
    /// `check_target`. `check_*` deduplicate the corresponding side.
    pub fn connect(
        &mut self,
        i: AgentIdx,
        j: AgentIdx,
        check_source: bool,
        check_target: bool,
    ) -> Result<&mut Self> {
        let n = self.population.len();
        if i >= n || j >= n {
            return Err(Error::out_of_range(format!("edge ({}, {}) in a population of {}", i, j, n)));
        }
        self.population[i].add_neighbor(j, check_source);
        if !self.directed {
            self.population[j].add_neighbor(i, check_target);
        }
        Ok(self)
    }

    /// `source target` rows for the current network.
    pub fn write_edgelist(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "source target")?;
        for agent in &self.population {
            for &j in agent.neighbors() {
                writeln!(w, "{} {}", agent.id(), self.population[j].id())?;
            }
        }
        Ok(())
    }

    /* States and parameters *******************************************/

    /// Register an extra state. Returns its dense code.
    pub fn add_state(
        &mut self,
        label: &str,
        kind: StateKind,
        update: Option<UpdateFun>,
    ) -> Result<StateCode> {
        self.states.add(label, kind, update)
    }

    /// Throw away the standard susceptible/exposed/removed triple and
    /// start from an empty state set.
    pub fn clear_states(&mut self) -> &mut Self {
        self.states = StateSet::empty();
        self
    }

    pub fn set_update_fun(&mut self, state: StateCode, fun: UpdateFun) -> Result<&mut Self> {
        if state >= self.states.len() {
            return Err(Error::out_of_range(format!("state code {}", state)));
        }
        self.states.update[state] = Some(fun);
        Ok(self)
    }

    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    pub fn state_label(&self, code: StateCode) -> Option<&str> {
        self.states.labels.get(code).map(|s| s.as_str())
    }

    pub fn state_kind(&self, code: StateCode) -> Option<StateKind> {
        self.states.kinds.get(code).copied()
    }

    pub fn is_exposed_state(&self, code: StateCode) -> bool {
        self.states.is_exposed(code)
    }

    pub fn add_param(&mut self, name: &str, value: Real) -> &mut Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn get_param(&self, name: &str) -> Option<Real> {
        self.params.get(name).copied()
    }

    /// Update an existing parameter.
    pub fn set_param(&mut self, name: &str, value: Real) -> Result<Real> {
        match self.params.get_mut(name) {
            Some(slot) => {
                let old = *slot;
                *slot = value;
                Ok(old)
            }
            None => Err(Error::unknown(format!("parameter {:?}", name))),
        }
    }

    pub fn params(&self) -> &BTreeMap<String, Real> {
        &self.params
    }

    pub fn view(&self) -> ModelView<'_> {
        ModelView {
            day: self.today,
            params: &self.params,
        }
    }

    pub fn set_mixers(&mut self, mixers: Mixers) -> &mut Self {
        self.mixers = mixers;
        self
    }

    pub fn mixers(&self) -> &Mixers {
        &self.mixers
    }

    /* Registries ******************************************************/

    /// Register a prototype virus with its initial prevalence.
    pub fn add_virus(&mut self, virus: Virus, prevalence: Prevalence) -> Result<&mut Self> {
        self.check_prevalence(prevalence)?;
        self.viruses.push(virus);
        self.virus_prevalence.push(prevalence);
        Ok(self)
    }

    /// Register a prototype tool with its initial prevalence.
    pub fn add_tool(&mut self, mut tool: Tool, prevalence: Prevalence) -> Result<&mut Self> {
        self.check_prevalence(prevalence)?;
        tool.set_id(self.tools.len());
        self.tools.push(tool);
        self.tool_prevalence.push(prevalence);
        Ok(self)
    }

    fn check_prevalence(&self, prevalence: Prevalence) -> Result<()> {
        match prevalence {
            Prevalence::Proportion(p) if !(0.0..=1.0).contains(&p) => {
                Err(Error::invalid(format!("prevalence {} not in [0, 1]", p)))
            }
            Prevalence::Count(c) if !self.population.is_empty() && c > self.population.len() => {
                Err(Error::out_of_range(format!(
                    "prevalence {} exceeds the population of {}",
                    c,
                    self.population.len()
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn viruses(&self) -> &[Virus] {
        &self.viruses
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Register an entity and return its id.
    pub fn add_entity(&mut self, name: &str) -> EntityId {
        let id = self.entities.len();
        self.entities.push(Entity::new(id, name));
        id
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /* RNG *************************************************************/

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn runif(&mut self) -> Real {
        self.rng.gen()
    }

    pub fn rng_mut(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /* Database access *************************************************/

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Enqueue an event directly; mostly useful from global actions.
    /// It is consumed by the next apply pass.
    pub fn enqueue(&mut self, ev: Event) {
        self.events.push(ev);
    }

    pub fn db_mut(&mut self) -> &mut Database {
        &mut self.db
    }

    pub fn set_sampling_freq(&mut self, freq: Day) -> &mut Self {
        self.db.set_sampling_freq(freq);
        self
    }

    /// Declare the user data columns tracked by the database.
    pub fn set_user_data(&mut self, names: Vec<String>) -> &mut Self {
        *self.db.user_data_mut() = crate::userdata::UserData::new(names);
        self
    }

    pub fn add_user_data(&mut self, row: &[Real]) -> Result<()> {
        let day = self.today;
        self.db.user_data_mut().add_row(day, row)
    }

    pub fn add_user_data_cell(&mut self, col: usize, value: Real) -> Result<()> {
        let day = self.today;
        self.db.user_data_mut().add_cell(day, col, value)
    }

    /* Toggles *********************************************************/

    pub fn queuing_on(&mut self) -> &mut Self {
        self.use_queuing = true;
        self
    }

    pub fn queuing_off(&mut self) -> &mut Self {
        self.use_queuing = false;
        self
    }

    pub fn verbose_on(&mut self) -> &mut Self {
        self.verbose = true;
        self
    }

    pub fn verbose_off(&mut self) -> &mut Self {
        self.verbose = false;
        self
    }

    pub fn queue(&self) -> &ActiveQueue {
        &self.queue
    }

    /* Rewiring and global actions *************************************/

    /// Install the default degree-preserving rewire at `proportion`.
    pub fn set_rewire_degseq(&mut self, proportion: Real) -> Result<&mut Self> {
        if !(0.0..=1.0).contains(&proportion) {
            return Err(Error::invalid(format!(
                "rewire proportion {} not in [0, 1]",
                proportion
            )));
        }
        let fun: RewireFun = Arc::new(
            |population: &mut [Agent], directed: bool, prop: Real, rng: &mut SmallRng| {
                rewire_degseq(population, directed, prop, rng)
            },
        );
        self.rewire = Some((fun, proportion));
        Ok(self)
    }

    pub fn set_rewire_fun(&mut self, fun: RewireFun, proportion: Real) -> &mut Self {
        self.rewire = Some((fun, proportion));
        self
    }

    /// Schedule `fun` for every step (`day = None`) or one specific day.
    pub fn add_global_action(
        &mut self,
        name: &str,
        day: Option<Day>,
        fun: GlobalFun,
    ) -> &mut Self {
        self.global_actions.push(GlobalAction {
            name: name.to_string(),
            day,
            fun,
        });
        self
    }

    /* Backup **********************************************************/

    /// Capture the current population (including the network) so that
    /// `reset` restores it exactly.
    pub fn set_backup(&mut self) -> &mut Self {
        self.backup = Some(self.population.clone());
        self
    }

    pub fn restore_backup(&mut self) -> Result<&mut Self> {
        match &self.backup {
            Some(backup) => {
                self.population = backup.clone();
                Ok(self)
            }
            None => Err(Error::invalid("no backup was captured")),
        }
    }

    /* Main loop *******************************************************/

    /// Size the scratch buffers, mark the model initialized and reset.
    pub fn init(&mut self, ndays: Day, seed: u64) -> Result<&mut Self> {
        if self.population.is_empty() {
            return Err(Error::invalid("the model has no population"));
        }
        if ndays < 1 {
            return Err(Error::invalid(format!("ndays = {} must be positive", ndays)));
        }
        self.ndays = ndays;
        for (i, agent) in self.population.iter_mut().enumerate() {
            agent.set_index(i);
        }
        let hint = (self.population.len() / 2).max(32);
        self.scratch.probs.reserve(hint);
        self.scratch.candidates.reserve(hint);
        self.rng = SmallRng::seed_from_u64(seed);
        self.initialized = true;
        self.reset()?;
        Ok(self)
    }

    /// Clear the database, restore the backup when one was captured,
    /// re-initialize every agent, distribute prevalence-scaled viruses
    /// and tools, materialise the initial infections and record day 0.
    pub fn reset(&mut self) -> Result<&mut Self> {
        self.check_init()?;
        if self.backup.is_some() {
            self.restore_backup()?;
        }
        let baseline = self.states.first_susceptible();
        for agent in &mut self.population {
            agent.reset(baseline);
        }
        for entity in &mut self.entities {
            entity.clear();
        }
        self.today = 0;
        self.events.clear();
        self.queue.resize(self.population.len());

        self.db.sync(&self.states.labels, &self.population);
        for k in 0..self.viruses.len() {
            let mut proto = std::mem::take(&mut self.viruses[k]);
            proto.clear_id();
            self.db.record_variant(&mut proto, None, 0)?;
            self.viruses[k] = proto;
        }

        self.dist_viruses()?;
        self.dist_tools()?;
        self.apply_events()?;
        self.db.record_day(0);
        Ok(self)
    }

    fn dist_viruses(&mut self) -> Result<()> {
        let n = self.population.len();
        for k in 0..self.viruses.len() {
            let target = self.prevalence_target(self.virus_prevalence[k], n)?;
            let chosen = rand::seq::index::sample(&mut self.rng, n, target);
            for i in chosen {
                self.events.push(Event::add_virus(i, self.viruses[k].clone()));
            }
        }
        Ok(())
    }

    fn dist_tools(&mut self) -> Result<()> {
        let n = self.population.len();
        for k in 0..self.tools.len() {
            let target = self.prevalence_target(self.tool_prevalence[k], n)?;
            let chosen = rand::seq::index::sample(&mut self.rng, n, target);
            for i in chosen {
                self.events.push(Event::add_tool(i, self.tools[k].clone()));
            }
        }
        Ok(())
    }

    fn prevalence_target(&self, prevalence: Prevalence, n: usize) -> Result<usize> {
        let target = match prevalence {
            Prevalence::Proportion(p) => (p * n as Real).floor() as usize,
            Prevalence::Count(c) => c,
        };
        if target > n {
            return Err(Error::out_of_range(format!(
                "prevalence {} exceeds the population of {}",
                target, n
            )));
        }
        Ok(target)
    }

    /// Run the simulation: seed, reset, then iterate `ndays` daily
    /// steps.
    pub fn run(&mut self, ndays: Day, seed: u64) -> Result<&mut Self> {
        let started = Instant::now();
        self.init(ndays, seed)?;

        let mut progress = Progress::new(self.ndays as usize, 80);
        for day in 1..=self.ndays {
            self.today = day;
            self.update_status()?;
            self.mutate()?;
            self.db.record_day(day);
            self.run_global_actions()?;
            self.rewire_step()?;
            if self.verbose {
                progress.next();
            }
        }

        let elapsed = started.elapsed();
        self.timer.last = Some(elapsed);
        self.timer.total += elapsed;
        self.timer.n_runs += 1;
        info!(
            "run of {} days over {} agents finished in {:.2?}",
            self.ndays,
            self.population.len(),
            elapsed
        );
        Ok(self)
    }

    /// Repeat `run` with seeds drawn from `seed`, invoking `fun` after
    /// each experiment. Every run starts from a fresh reset.
    pub fn run_multiple(
        &mut self,
        nexperiments: usize,
        ndays: Day,
        seed: u64,
        mut fun: impl FnMut(&mut Model) -> Result<()>,
    ) -> Result<&mut Self> {
        let mut seeder = SmallRng::seed_from_u64(seed);
        for _ in 0..nexperiments {
            let s = seeder.gen();
            self.run(ndays, s)?;
            fun(self)?;
        }
        Ok(self)
    }

    /// Run `nexperiments` independent replicates in parallel, each on a
    /// cloned model, and collect their databases.
    pub fn run_multiple_parallel(
        &self,
        nexperiments: usize,
        ndays: Day,
        seed: u64,
    ) -> Result<Vec<Database>> {
        let mut seeder = SmallRng::seed_from_u64(seed);
        let seeds: Vec<u64> = (0..nexperiments).map(|_| seeder.gen()).collect();
        seeds
            .into_par_iter()
            .map(|s| {
                let mut model = self.clone();
                model.run(ndays, s)?;
                Ok(model.db.clone())
            })
            .collect()
    }

    /// Latest run duration, cumulative duration and replicate count.
    pub fn elapsed(&self) -> (Option<Duration>, Duration, usize) {
        (self.timer.last, self.timer.total, self.timer.n_runs)
    }

    /* Step phases *****************************************************/

    /// Scan pass followed by the apply pass: visit every queued agent,
    /// run its state's update function, then drain the event buffer.
    pub fn update_status(&mut self) -> Result<()> {
        self.check_init()?;
        for i in 0..self.population.len() {
            if self.use_queuing && !self.queue.is_active(i) {
                continue;
            }
            let state = self.population[i].state();
            let fun = self.states.update.get(state).cloned().flatten();
            if let Some(fun) = fun {
                let mut ctx = AgentCtx { idx: i, model: self };
                fun(&mut ctx)?;
            }
        }
        self.apply_events()
    }

    /// Give every virus carried in an exposed state a chance to mutate;
    /// mutated sequences are re-registered with the database.
    pub fn mutate(&mut self) -> Result<()> {
        for i in 0..self.population.len() {
            if !self.states.is_exposed(self.population[i].state()) {
                continue;
            }
            for pos in 0..self.population[i].n_viruses() {
                let fun = match self.population[i].viruses()[pos].mutation() {
                    Some(f) => f.clone(),
                    None => continue,
                };
                let mut virus = self.population[i].viruses()[pos].clone();
                let mutated = fun(&self.population[i], &mut virus, &mut self.rng);
                if mutated {
                    let state = self.population[i].state();
                    let day = self.today;
                    self.db.record_variant(&mut virus, Some(state), day)?;
                }
                self.population[i].viruses_mut()[pos] = virus;
            }
        }
        Ok(())
    }

    /// Drain the event buffer in FIFO order. Handlers may append
    /// follow-up events, which are processed in the same drain. The
    /// active-set deltas are folded in afterwards.
    pub(crate) fn apply_events(&mut self) -> Result<()> {
        let mut i = 0;
        loop {
            let ev = match self.events.get(i) {
                Some(ev) => ev.clone(),
                None => break,
            };
            if let Err(e) = self.apply_one(ev) {
                error!("apply-events aborted at event {}: {}", i, e);
                return Err(e);
            }
            i += 1;
        }
        self.events.clear();
        let strict = self.rewire.is_none();
        self.queue.flush(strict);
        Ok(())
    }

    fn apply_one(&mut self, ev: Event) -> Result<()> {
        let idx = ev.agent;
        if idx >= self.population.len() {
            return Err(Error::out_of_range(format!(
                "event targets agent {} of {}",
                idx,
                self.population.len()
            )));
        }

        let (new_state, queue_delta) = ev.coalesce(&self.population[idx])?;
        if let Some(s) = new_state {
            if s >= self.states.len() {
                return Err(Error::out_of_range(format!("state code {}", s)));
            }
        }
        let prev_state = self.population[idx].state();

        let custom = match &ev.kind {
            EventKind::AddVirus { .. } => self.population[idx].on_add_virus.clone(),
            EventKind::RmVirus { .. } => self.population[idx].on_rm_virus.clone(),
            EventKind::AddTool { .. } => self.population[idx].on_add_tool.clone(),
            EventKind::RmTool { .. } => self.population[idx].on_rm_tool.clone(),
            _ => None,
        };

        {
            let Model {
                population,
                db,
                events,
                entities,
                today,
                ..
            } = self;
            let agent = &mut population[idx];
            let mut ctx = ApplyCtx {
                day: *today,
                prev_state,
                new_state,
                db,
                events,
                entities: entities.as_mut_slice(),
            };
            match custom {
                Some(handler) => handler(agent, &ev, &mut ctx)?,
                None => match &ev.kind {
                    EventKind::AddVirus { .. } => default_add_virus(agent, &ev, &mut ctx)?,
                    EventKind::RmVirus { .. } => default_rm_virus(agent, &ev, &mut ctx)?,
                    EventKind::AddTool { .. } => default_add_tool(agent, &ev, &mut ctx)?,
                    EventKind::RmTool { .. } => default_rm_tool(agent, &ev, &mut ctx)?,
                    EventKind::AddEntity { .. } => default_add_entity(agent, &ev, &mut ctx)?,
                    EventKind::RmEntity { .. } => default_rm_entity(agent, &ev, &mut ctx)?,
                    EventKind::ChangeState => {}
                },
            }
        }

        if let Some(state) = new_state {
            if state != prev_state {
                self.population[idx].set_state(state);
                self.db.update_state(prev_state, state);
                let carried: Vec<_> = self.population[idx]
                    .viruses()
                    .iter()
                    .filter_map(|v| v.id())
                    .collect();
                for vid in carried {
                    self.db.variant_delta(vid, prev_state, -1)?;
                    self.db.variant_delta(vid, state, 1)?;
                }
            }
        }

        if self.use_queuing && queue_delta != queue_values::NO_ONE {
            let everyone = queue_delta.abs() >= queue_values::EVERYONE;
            let Model {
                population, queue, ..
            } = self;
            let neighbors = population[idx].neighbors();
            if queue_delta > 0 {
                queue.add(idx, neighbors, everyone);
            } else {
                queue.sub(idx, neighbors, everyone);
            }
        }

        Ok(())
    }

    fn run_global_actions(&mut self) -> Result<()> {
        let due: Vec<(String, GlobalFun)> = self
            .global_actions
            .iter()
            .filter(|ga| ga.day.map_or(true, |d| d == self.today))
            .map(|ga| (ga.name.clone(), ga.fun.clone()))
            .collect();
        for (name, fun) in due {
            trace!("global action {:?} on day {}", name, self.today);
            fun(self)?;
        }
        if !self.events.is_empty() {
            self.apply_events()?;
        }
        Ok(())
    }

    fn rewire_step(&mut self) -> Result<()> {
        if let Some((fun, proportion)) = self.rewire.clone() {
            let directed = self.directed;
            fun(&mut self.population, directed, proportion, &mut self.rng)?;
        }
        Ok(())
    }

    /* Scan-phase helpers used by the default update functions *********/

    /// Roulette over every virus carried by `idx`'s neighbors, weighted
    /// by infectiousness and the agents' tool reductions. Returns the
    /// picked `(neighbor, virus position)`.
    pub(crate) fn pick_transmission(
        &mut self,
        idx: AgentIdx,
    ) -> Result<Option<(AgentIdx, usize)>> {
        let Model {
            population,
            scratch,
            rng,
            mixers,
            params,
            today,
            ..
        } = self;
        let view = ModelView {
            day: *today,
            params,
        };
        let agent = &population[idx];
        scratch.probs.clear();
        scratch.candidates.clear();

        for &n in agent.neighbors() {
            let neighbor = &population[n];
            for (pos, virus) in neighbor.viruses().iter().enumerate() {
                let p = (1.0 - agent.susceptibility_reduction(virus, &view, mixers))
                    * virus.prob_infecting(neighbor, &view)
                    * (1.0 - neighbor.transmission_reduction(virus, &view, mixers));
                scratch.probs.push(p);
                scratch.candidates.push((n, pos));
            }
        }

        if scratch.probs.is_empty() {
            return Ok(None);
        }
        Ok(roulette(&scratch.probs, rng).map(|w| scratch.candidates[w]))
    }

    /// Roulette over the interleaved death/recovery chances of every
    /// virus carried by `idx`. Even slots are deaths, odd slots
    /// recoveries; slot `2k` and `2k + 1` belong to virus `k`.
    pub(crate) fn pick_exposed_event(&mut self, idx: AgentIdx) -> Result<Option<usize>> {
        let Model {
            population,
            scratch,
            rng,
            mixers,
            params,
            today,
            ..
        } = self;
        let view = ModelView {
            day: *today,
            params,
        };
        let agent = &population[idx];
        scratch.probs.clear();

        for virus in agent.viruses() {
            scratch.probs.push(
                virus.prob_death(agent, &view) * (1.0 - agent.death_reduction(virus, &view, mixers)),
            );
            scratch.probs.push(
                virus.prob_recovery(agent, &view)
                    * (1.0 - agent.recovery_enhancer(virus, &view, mixers)),
            );
        }

        if scratch.probs.is_empty() {
            return Ok(None);
        }
        Ok(roulette(&scratch.probs, rng))
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Population size   : {}", self.population.len())?;
        writeln!(f, "Days (duration)   : {} (of {})", self.today, self.ndays)?;
        writeln!(f, "Number of variants: {}", self.db.n_variants())?;
        writeln!(f, "Virus(es):")?;
        for (v, prevalence) in self.viruses.iter().zip(&self.virus_prevalence) {
            writeln!(f, " - {} (baseline prevalence: {:?})", v.name(), prevalence)?;
        }
        writeln!(f, "Tool(s):")?;
        for (t, prevalence) in self.tools.iter().zip(&self.tool_prevalence) {
            writeln!(f, " - {} (baseline prevalence: {:?})", t.name(), prevalence)?;
        }
        if !self.params.is_empty() {
            writeln!(f, "Parameters:")?;
            for (name, value) in &self.params {
                writeln!(f, " - {} = {}", name, value)?;
            }
        }
        writeln!(f, "Today's totals:")?;
        for (code, label) in self.states.labels.iter().enumerate() {
            writeln!(f, " - {:<16}: {}", label, self.db.today_total(code))?;
        }
        Ok(())
    }
}

/// Handle on one agent during the scan phase: read access to the world
/// plus the event-producing operations. Producers validate eagerly and
/// defer the mutation to the apply pass.
pub struct AgentCtx<'m> {
    pub(crate) idx: AgentIdx,
    pub(crate) model: &'m mut Model,
}

impl<'m> AgentCtx<'m> {
    pub fn index(&self) -> AgentIdx {
        self.idx
    }

    pub fn agent(&self) -> &Agent {
        &self.model.population[self.idx]
    }

    pub fn model(&self) -> &Model {
        self.model
    }

    // Mutable access stays crate-internal: handing `&mut Model` to user
    // update functions would allow mid-step recursion into the pipeline.
    pub(crate) fn model_mut(&mut self) -> &mut Model {
        self.model
    }

    pub fn runif(&mut self) -> Real {
        self.model.runif()
    }

    /// Enqueue adding `virus` to this agent. The virus must carry a
    /// registered variant id (prototype clones and circulating instances
    /// do).
    pub fn add_virus(
        &mut self,
        virus: Virus,
        new_state: Option<StateCode>,
        queue: Option<i32>,
    ) -> Result<()> {
        if virus.id().is_none() {
            return Err(Error::unknown(format!(
                "virus {:?} not registered with the model",
                virus.name()
            )));
        }
        self.model
            .events
            .push(Event::add_virus(self.idx, virus).with_state(new_state).with_queue(queue));
        Ok(())
    }

    pub fn add_tool(
        &mut self,
        tool: Tool,
        new_state: Option<StateCode>,
        queue: Option<i32>,
    ) -> Result<()> {
        self.model
            .events
            .push(Event::add_tool(self.idx, tool).with_state(new_state).with_queue(queue));
        Ok(())
    }

    /// Enqueue removing the virus at `pos` in this agent's list.
    pub fn rm_virus(
        &mut self,
        pos: usize,
        new_state: Option<StateCode>,
        queue: Option<i32>,
    ) -> Result<()> {
        let agent = self.agent();
        let virus = agent.viruses().get(pos).ok_or_else(|| {
            Error::out_of_range(format!(
                "virus position {} of agent {} (has {})",
                pos,
                self.idx,
                agent.n_viruses()
            ))
        })?;
        if virus.host() != Some(self.idx) {
            return Err(Error::ownership(format!(
                "virus at position {} is hosted by {:?}, not agent {}",
                pos,
                virus.host(),
                self.idx
            )));
        }
        self.model
            .events
            .push(Event::rm_virus(self.idx, pos).with_state(new_state).with_queue(queue));
        Ok(())
    }

    pub fn rm_tool(
        &mut self,
        pos: usize,
        new_state: Option<StateCode>,
        queue: Option<i32>,
    ) -> Result<()> {
        let agent = self.agent();
        let tool = agent.tools().get(pos).ok_or_else(|| {
            Error::out_of_range(format!(
                "tool position {} of agent {} (has {})",
                pos,
                self.idx,
                agent.n_tools()
            ))
        })?;
        if tool.agent() != Some(self.idx) {
            return Err(Error::ownership(format!(
                "tool at position {} belongs to {:?}, not agent {}",
                pos,
                tool.agent(),
                self.idx
            )));
        }
        self.model
            .events
            .push(Event::rm_tool(self.idx, pos).with_state(new_state).with_queue(queue));
        Ok(())
    }

    pub fn change_state(&mut self, new_state: StateCode, queue: i32) -> Result<()> {
        if new_state >= self.model.states.len() {
            return Err(Error::out_of_range(format!("state code {}", new_state)));
        }
        self.model
            .events
            .push(Event::change_state(self.idx, new_state, queue));
        Ok(())
    }

    pub fn add_entity(&mut self, entity: EntityId) -> Result<()> {
        if entity >= self.model.entities.len() {
            return Err(Error::unknown(format!("entity {} not registered", entity)));
        }
        self.model
            .events
            .push(Event::new(self.idx, EventKind::AddEntity { entity }));
        Ok(())
    }

    pub fn rm_entity(&mut self, entity: EntityId) -> Result<()> {
        if entity >= self.model.entities.len() {
            return Err(Error::unknown(format!("entity {} not registered", entity)));
        }
        if !self.agent().entities().contains(&entity) {
            return Err(Error::ownership(format!(
                "agent {} is not a member of entity {}",
                self.idx, entity
            )));
        }
        self.model
            .events
            .push(Event::new(self.idx, EventKind::RmEntity { entity }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const S: StateCode = 0;
    const I: StateCode = 1;
    const R: StateCode = 2;

    /// SIR over a small world: infection moves susceptible -> exposed
    /// slot (used as "infected"), recovery moves into removed.
    fn sir_model(n: usize, k: usize, p: Real, beta: Real, gamma: Real) -> Model {
        let mut model = Model::new();
        model.seed(2023);
        model.agents_smallworld(n, k, p, false).unwrap();
        let mut virus = Virus::new("flu");
        virus.set_prob_infecting(beta).unwrap();
        virus.set_prob_recovery(gamma).unwrap();
        virus.set_state(Some(I), Some(R), Some(R));
        model
            .add_virus(virus, Prevalence::Proportion(0.01))
            .unwrap();
        model
    }

    fn totals_by_day(model: &Model) -> BTreeMap<Day, Vec<i64>> {
        let mut by_day: BTreeMap<Day, Vec<i64>> = BTreeMap::new();
        for row in model.db().hist_total() {
            let entry = by_day
                .entry(row.day)
                .or_insert_with(|| vec![0; model.n_states()]);
            entry[row.state] = row.count;
        }
        by_day
    }

    #[test]
    fn sir_smallworld_conserves_population() {
        let mut model = sir_model(1000, 5, 0.01, 0.3, 0.15);
        model.run(60, 123).unwrap();

        let by_day = totals_by_day(&model);
        assert_eq!(by_day.len(), 61);
        for (day, counts) in &by_day {
            assert_eq!(
                counts.iter().sum::<i64>(),
                1000,
                "population leak on day {}",
                day
            );
            assert!(counts.iter().all(|&c| c >= 0), "negative count on day {}", day);
        }

        // Day zero carries the initial distribution.
        assert_eq!(by_day[&0][I], 10);
        assert_eq!(by_day[&0][S], 990);

        // Nobody returns to susceptible, so every later infection shows
        // up in the transmission log.
        let susceptible_end = by_day[&60][S];
        let ever_infected = 1000 - susceptible_end;
        assert_eq!(
            model.db().transmissions().len() as i64,
            ever_infected - 10,
            "transmission log disagrees with the epidemic size"
        );
        assert!(ever_infected > 10, "the epidemic never took off");

        for t in model.db().transmissions() {
            assert!(t.source < 1000 && t.target < 1000);
            assert!(t.day >= 1);
            assert_eq!(t.variant, 0);
        }
    }

    #[test]
    fn run_is_deterministic_per_seed() {
        let mut model = sir_model(300, 4, 0.0, 0.25, 0.2);
        model.run(30, 7).unwrap();
        let first: Vec<_> = model.db().hist_total().to_vec();

        model.run(30, 7).unwrap();
        let second: Vec<_> = model.db().hist_total().to_vec();
        assert_eq!(first, second);

        model.run(30, 8).unwrap();
        let third: Vec<_> = model.db().hist_total().to_vec();
        assert_ne!(first, third, "different seeds should diverge");
    }

    #[test]
    fn queuing_matches_full_scan() {
        let mut queued = sir_model(200, 4, 0.0, 0.3, 0.1);
        queued.run(25, 99).unwrap();
        let a = totals_by_day(&queued);

        let mut scanned = sir_model(200, 4, 0.0, 0.3, 0.1);
        scanned.queuing_off();
        scanned.run(25, 99).unwrap();
        let b = totals_by_day(&scanned);

        assert_eq!(a, b, "the active-set queue changed the dynamics");
    }

    #[test]
    fn empty_prevalence_keeps_everyone_susceptible() {
        let mut model = Model::new();
        model.agents_smallworld(100, 3, 0.0, false).unwrap();
        let mut virus = Virus::new("flu");
        virus.set_state(Some(I), Some(R), Some(R));
        model.add_virus(virus, Prevalence::Count(0)).unwrap();
        model.run(10, 5).unwrap();
        assert_eq!(model.db().today_total(S), 100);
        assert!(model.db().transmissions().is_empty());
    }

    #[test]
    fn prevalence_above_population_fails() {
        let mut model = Model::new();
        model.agents_smallworld(100, 3, 0.0, false).unwrap();
        let virus = Virus::new("flu");
        let res = model.add_virus(virus, Prevalence::Count(101));
        assert!(matches!(res, Err(Error::OutOfRange(_))));
    }

    #[test]
    fn unregistered_state_in_virus_config_fails_at_apply() {
        let mut model = Model::new();
        model.agents_smallworld(50, 2, 0.0, false).unwrap();
        let mut virus = Virus::new("flu");
        virus.set_state(Some(7), None, None);
        model.add_virus(virus, Prevalence::Count(1)).unwrap();
        assert!(matches!(model.run(5, 1), Err(Error::OutOfRange(_))));
    }

    #[test]
    fn rewire_inside_run_preserves_degrees() {
        let mut model = sir_model(120, 4, 0.0, 0.2, 0.2);
        model.set_rewire_degseq(0.2).unwrap();
        model.init(1, 3).unwrap();
        let before: Vec<usize> = model
            .population()
            .iter()
            .map(|a| a.neighbors().len())
            .collect();

        model.run(20, 3).unwrap();
        let after: Vec<usize> = model
            .population()
            .iter()
            .map(|a| a.neighbors().len())
            .collect();
        assert_eq!(before, after);

        for (i, agent) in model.population().iter().enumerate() {
            for &j in agent.neighbors() {
                assert!(
                    model.population()[j].neighbors().contains(&i),
                    "asymmetric link {} -> {}",
                    i,
                    j
                );
            }
        }
    }

    #[test]
    fn global_action_fires_on_its_day() {
        let mut model = sir_model(80, 3, 0.0, 0.2, 0.2);
        model.add_global_action(
            "mask the first agent",
            Some(4),
            Arc::new(|m: &mut Model| {
                let mut tool = Tool::new("mask");
                tool.set_susceptibility_reduction(0.9)?;
                m.enqueue(Event::add_tool(0, tool));
                Ok(())
            }),
        );
        model.run(10, 11).unwrap();
        assert!(model.population()[0].has_tool("mask"));
        assert_eq!(model.population()[0].tools()[0].date(), 4);
    }

    #[test]
    fn post_immunity_grants_tool_on_recovery() {
        let mut model = Model::new();
        model.agents_smallworld(60, 3, 0.0, false).unwrap();
        let mut virus = Virus::new("flu");
        virus.set_prob_infecting(0.0).unwrap();
        virus.set_prob_recovery(1.0).unwrap();
        virus.set_state(Some(I), Some(R), Some(R));
        virus.set_post_immunity(0.8).unwrap();
        model.add_virus(virus, Prevalence::Count(5)).unwrap();
        model.run(3, 21).unwrap();

        let immune = model
            .population()
            .iter()
            .filter(|a| a.has_tool("immunity (flu)"))
            .count();
        assert_eq!(immune, 5, "every recovered agent gets the immunity tool");
        assert_eq!(model.db().today_total(R), 5);
    }

    #[test]
    fn mutation_registers_a_child_variant() {
        let mut model = Model::new();
        model.agents_smallworld(40, 3, 0.0, false).unwrap();
        let mut virus = Virus::new("flu");
        virus.set_prob_infecting(0.0).unwrap();
        virus.set_prob_recovery(0.0).unwrap();
        virus.set_state(Some(I), Some(R), Some(R));
        virus.set_mutation(Arc::new(|_agent, v: &mut Virus, _rng: &mut SmallRng| {
            if v.seq().is_none() {
                v.set_seq(vec![1u8]);
                true
            } else {
                false
            }
        }));
        model.add_virus(virus, Prevalence::Count(1)).unwrap();
        model.run(5, 13).unwrap();

        assert_eq!(model.db().n_variants(), 2);
        assert_eq!(model.db().variant_parent(1), Some(Some(0)));
        assert_eq!(model.db().variant_origin(1), Some(1));
        // The host's count moved to the child variant.
        assert_eq!(model.db().today_variant(0, I), 0);
        assert_eq!(model.db().today_variant(1, I), 1);
    }

    #[test]
    fn entity_membership_round_trip() {
        let mut model = Model::new();
        model.agents_smallworld(20, 2, 0.0, false).unwrap();
        let ward = model.add_entity("ward");
        model.init(1, 1).unwrap();

        model.enqueue(Event::new(3, EventKind::AddEntity { entity: ward }));
        model.enqueue(Event::new(7, EventKind::AddEntity { entity: ward }));
        model.apply_events().unwrap();
        assert_eq!(model.entities()[ward].n_agents(), 2);
        assert!(model.population()[3].entities().contains(&ward));

        model.enqueue(Event::new(3, EventKind::RmEntity { entity: ward }));
        model.apply_events().unwrap();
        assert_eq!(model.entities()[ward].agents(), &[7]);
        assert!(model.population()[3].entities().is_empty());
    }

    #[test]
    fn update_fun_errors_abort_the_step() {
        let mut model = Model::new();
        model.agents_smallworld(10, 2, 0.0, false).unwrap();
        model
            .set_update_fun(
                S,
                Arc::new(|_ctx: &mut AgentCtx| Err(Error::invalid("boom"))),
            )
            .unwrap();
        model.queuing_off();
        let mut virus = Virus::new("flu");
        virus.set_state(Some(I), Some(R), Some(R));
        model.add_virus(virus, Prevalence::Count(1)).unwrap();
        assert!(model.run(3, 2).is_err());
    }

    #[test]
    fn parallel_replicates_agree_with_sequential() {
        let model = sir_model(150, 4, 0.0, 0.25, 0.2);
        let dbs = model.run_multiple_parallel(4, 15, 17).unwrap();
        assert_eq!(dbs.len(), 4);
        for db in &dbs {
            let total: i64 = db.today_totals().iter().sum();
            assert_eq!(total, 150);
        }

        // Same seed stream sequentially gives the same first replicate.
        let mut sequential = sir_model(150, 4, 0.0, 0.25, 0.2);
        let mut seeder = SmallRng::seed_from_u64(17);
        let first_seed: u64 = seeder.gen();
        sequential.run(15, first_seed).unwrap();
        assert_eq!(sequential.db().hist_total(), dbs[0].hist_total());
    }

    #[test]
    fn model_display_mentions_viruses() {
        let mut model = sir_model(50, 3, 0.0, 0.3, 0.1);
        model.run(5, 1).unwrap();
        let text = format!("{}", model);
        assert!(text.contains("flu"));
        assert!(text.contains("Population size   : 50"));
    }

    #[test]
    fn uninitialized_model_refuses_to_step() {
        let mut model = Model::new();
        model.agents_smallworld(10, 2, 0.0, false).unwrap();
        assert!(matches!(model.update_status(), Err(Error::Uninitialized)));
        assert!(matches!(model.reset(), Err(Error::Uninitialized)));
    }
}

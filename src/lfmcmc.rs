use crate::error::{Error, Result};
use crate::prelude::Real;
use getset::CopyGetters;
use log::*;
use ndarray::Array2;
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runs the simulator on a parameter vector and returns its raw output.
pub type SimFun<D> = Arc<dyn Fn(&[Real], &mut SmallRng) -> D + Send + Sync>;

/// Reduces raw output to summary statistics (written into the provided
/// buffer, which arrives cleared).
pub type SummaryFun<D> = Arc<dyn Fn(&mut Vec<Real>, &D) + Send + Sync>;

/// Writes a new proposal into the first argument, starting from the last
/// accepted parameters.
pub type ProposalFun = Arc<dyn Fn(&mut [Real], &[Real], &mut SmallRng) + Send + Sync>;

/// Scores simulated statistics against the observed ones.
pub type KernelFun = Arc<dyn Fn(&[Real], &[Real], Real) -> Real + Send + Sync>;

/// Gaussian step proposal with unit scale.
pub fn proposal_normal(new_params: &mut [Real], old_params: &[Real], rng: &mut SmallRng) {
    for (new, old) in new_params.iter_mut().zip(old_params) {
        let z: Real = rng.sample(StandardNormal);
        *new = old + z;
    }
}

/// Factory for a Gaussian proposal with `scale`, reflecting excursions
/// back into `[lb, ub]`: the overflow is folded across the violated
/// bound, with the parity of `floor(delta / (ub - lb))` deciding which
/// side the point lands on.
pub fn make_proposal_norm_reflective(scale: Real, lb: Real, ub: Real) -> ProposalFun {
    Arc::new(move |new_params, old_params, rng| {
        for (new, old) in new_params.iter_mut().zip(old_params) {
            let z: Real = rng.sample(StandardNormal);
            *new = old + z * scale;
        }

        let delta = ub - lb;
        for p in new_params.iter_mut() {
            if *p > ub {
                let above = *p - ub;
                let odd = (above / delta).floor() as i64 % 2;
                let above = above - (above / delta).floor() * delta;
                *p = if odd == 1 { lb + above } else { ub - above };
            } else if *p < lb {
                let below = lb - *p;
                let odd = (below / delta).floor() as i64 % 2;
                let below = below - (below / delta).floor() * delta;
                *p = if odd == 1 { ub - below } else { lb + below };
            }
        }
    })
}

fn l2_distance(a: &[Real], b: &[Real]) -> Real {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<Real>()
        .sqrt()
}

/// Indicator kernel: 1 iff the L2 distance between the statistics is
/// below epsilon.
pub fn kernel_uniform(simulated: &[Real], observed: &[Real], epsilon: Real) -> Real {
    if l2_distance(simulated, observed) < epsilon {
        1.0
    } else {
        0.0
    }
}

const SQRT_2PI: Real = 2.5066282746310002;

/// Gaussian kernel with epsilon-widened bandwidth.
pub fn kernel_gaussian(simulated: &[Real], observed: &[Real], epsilon: Real) -> Real {
    let d = l2_distance(simulated, observed);
    let bw = 1.0 + epsilon * epsilon / 3.0;
    (-0.5 * d * d / (bw * bw)).exp() / SQRT_2PI
}

/// Likelihood-Free MCMC: calibrates simulator parameters against
/// observed summary statistics by accepting or rejecting simulated runs
/// through a kernel score.
#[derive(Clone, CopyGetters)]
pub struct Lfmcmc<D> {
    observed_data: D,
    observed_stats: Vec<Real>,

    simulation_fun: Option<SimFun<D>>,
    summary_fun: Option<SummaryFun<D>>,
    proposal_fun: ProposalFun,
    kernel_fun: KernelFun,

    rng: SmallRng,

    #[getset(get_copy = "pub")]
    n_samples: usize,
    #[getset(get_copy = "pub")]
    n_params: usize,
    #[getset(get_copy = "pub")]
    n_stats: usize,
    #[getset(get_copy = "pub")]
    epsilon: Real,

    initial_params: Vec<Real>,
    accepted_params: Vec<Real>,
    accepted_stats: Vec<Real>,

    all_sample_params: Array2<Real>,
    all_sample_stats: Array2<Real>,
    all_sample_scores: Vec<Real>,
    all_sample_drawn_prob: Vec<Real>,
    all_sample_acceptance: Vec<bool>,

    all_accepted_params: Array2<Real>,
    all_accepted_stats: Array2<Real>,
    all_accepted_scores: Vec<Real>,

    param_names: Vec<String>,
    stat_names: Vec<String>,

    elapsed: Option<Duration>,
}

impl<D> Lfmcmc<D> {
    pub fn new(observed_data: D) -> Self {
        Lfmcmc {
            observed_data,
            observed_stats: Vec::new(),
            simulation_fun: None,
            summary_fun: None,
            proposal_fun: Arc::new(proposal_normal),
            kernel_fun: Arc::new(kernel_uniform),
            rng: SmallRng::from_entropy(),
            n_samples: 0,
            n_params: 0,
            n_stats: 0,
            epsilon: 0.0,
            initial_params: Vec::new(),
            accepted_params: Vec::new(),
            accepted_stats: Vec::new(),
            all_sample_params: Array2::zeros((0, 0)),
            all_sample_stats: Array2::zeros((0, 0)),
            all_sample_scores: Vec::new(),
            all_sample_drawn_prob: Vec::new(),
            all_sample_acceptance: Vec::new(),
            all_accepted_params: Array2::zeros((0, 0)),
            all_accepted_stats: Array2::zeros((0, 0)),
            all_accepted_scores: Vec::new(),
            param_names: Vec::new(),
            stat_names: Vec::new(),
            elapsed: None,
        }
    }

    pub fn set_observed_data(&mut self, data: D) -> &mut Self {
        self.observed_data = data;
        self
    }

    pub fn set_simulation_fun(&mut self, fun: SimFun<D>) -> &mut Self {
        self.simulation_fun = Some(fun);
        self
    }

    pub fn set_summary_fun(&mut self, fun: SummaryFun<D>) -> &mut Self {
        self.summary_fun = Some(fun);
        self
    }

    pub fn set_proposal_fun(&mut self, fun: ProposalFun) -> &mut Self {
        self.proposal_fun = fun;
        self
    }

    pub fn set_kernel_fun(&mut self, fun: KernelFun) -> &mut Self {
        self.kernel_fun = fun;
        self
    }

    /// Reseed the generator.
    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn set_param_names(&mut self, names: Vec<String>) -> &mut Self {
        self.param_names = names;
        self
    }

    pub fn set_stat_names(&mut self, names: Vec<String>) -> &mut Self {
        self.stat_names = names;
        self
    }

    /// Simulate -> summarise -> kernel-score -> accept/reject for
    /// `n_samples` iterations starting from `params_init`.
    pub fn run(
        &mut self,
        params_init: Vec<Real>,
        n_samples: usize,
        epsilon: Real,
        seed: Option<u64>,
    ) -> Result<&mut Self> {
        let simulation_fun = self
            .simulation_fun
            .clone()
            .ok_or_else(|| Error::invalid("no simulation function set"))?;
        let summary_fun = self
            .summary_fun
            .clone()
            .ok_or_else(|| Error::invalid("no summary function set"))?;
        if params_init.is_empty() {
            return Err(Error::invalid("empty initial parameter vector"));
        }
        if n_samples < 1 {
            return Err(Error::invalid("n_samples must be positive"));
        }
        if let Some(s) = seed {
            self.seed(s);
        }

        let started = Instant::now();
        self.n_samples = n_samples;
        self.epsilon = epsilon;
        self.n_params = params_init.len();
        self.initial_params = params_init.clone();

        self.observed_stats.clear();
        summary_fun(&mut self.observed_stats, &self.observed_data);
        self.n_stats = self.observed_stats.len();
        if self.n_stats == 0 {
            return Err(Error::invalid("summary function produced no statistics"));
        }

        self.all_sample_params = Array2::zeros((n_samples, self.n_params));
        self.all_sample_stats = Array2::zeros((n_samples, self.n_stats));
        self.all_sample_scores = vec![0.0; n_samples];
        self.all_sample_drawn_prob = vec![0.0; n_samples];
        self.all_sample_acceptance = vec![false; n_samples];
        self.all_accepted_params = Array2::zeros((n_samples, self.n_params));
        self.all_accepted_stats = Array2::zeros((n_samples, self.n_stats));
        self.all_accepted_scores = vec![0.0; n_samples];

        // Iteration zero scores the initial parameters.
        let data0 = simulation_fun(&params_init, &mut self.rng);
        let mut stats = Vec::with_capacity(self.n_stats);
        summary_fun(&mut stats, &data0);
        let score0 = (self.kernel_fun)(&stats, &self.observed_stats, epsilon);

        self.accepted_params = params_init.clone();
        self.accepted_stats = stats.clone();
        self.all_sample_scores[0] = score0;
        self.all_accepted_scores[0] = score0;
        self.all_sample_acceptance[0] = true;
        for k in 0..self.n_params {
            self.all_sample_params[[0, k]] = params_init[k];
            self.all_accepted_params[[0, k]] = params_init[k];
        }
        for k in 0..self.n_stats {
            self.all_sample_stats[[0, k]] = stats[k];
            self.all_accepted_stats[[0, k]] = stats[k];
        }

        let mut proposed = vec![0.0; self.n_params];
        for i in 1..n_samples {
            (self.proposal_fun)(&mut proposed, &self.accepted_params, &mut self.rng);

            let data_i = simulation_fun(&proposed, &mut self.rng);
            stats.clear();
            summary_fun(&mut stats, &data_i);
            let score = (self.kernel_fun)(&stats, &self.observed_stats, epsilon);

            self.all_sample_scores[i] = score;
            for k in 0..self.n_params {
                self.all_sample_params[[i, k]] = proposed[k];
            }
            for k in 0..self.n_stats {
                self.all_sample_stats[[i, k]] = stats[k];
            }

            let draw: Real = self.rng.gen();
            self.all_sample_drawn_prob[i] = draw;

            let ratio = score / self.all_accepted_scores[i - 1];
            if draw < ratio.min(1.0) {
                self.all_sample_acceptance[i] = true;
                self.all_accepted_scores[i] = score;
                self.accepted_params.copy_from_slice(&proposed);
                self.accepted_stats.clear();
                self.accepted_stats.extend_from_slice(&stats);
            } else {
                self.all_accepted_scores[i] = self.all_accepted_scores[i - 1];
            }

            for k in 0..self.n_params {
                self.all_accepted_params[[i, k]] = self.accepted_params[k];
            }
            for k in 0..self.n_stats {
                self.all_accepted_stats[[i, k]] = self.accepted_stats[k];
            }
        }

        self.elapsed = Some(started.elapsed());
        info!(
            "lfmcmc: {} samples, {} params, {} stats in {:.2?}",
            n_samples,
            self.n_params,
            self.n_stats,
            self.elapsed.unwrap_or_default()
        );
        Ok(self)
    }

    pub fn observed_stats(&self) -> &[Real] {
        &self.observed_stats
    }

    pub fn initial_params(&self) -> &[Real] {
        &self.initial_params
    }

    /// Last accepted parameter vector.
    pub fn current_params(&self) -> &[Real] {
        &self.accepted_params
    }

    pub fn all_sample_params(&self) -> &Array2<Real> {
        &self.all_sample_params
    }

    pub fn all_sample_stats(&self) -> &Array2<Real> {
        &self.all_sample_stats
    }

    pub fn all_sample_acceptance(&self) -> &[bool] {
        &self.all_sample_acceptance
    }

    pub fn all_sample_drawn_prob(&self) -> &[Real] {
        &self.all_sample_drawn_prob
    }

    pub fn all_accepted_params(&self) -> &Array2<Real> {
        &self.all_accepted_params
    }

    pub fn all_accepted_stats(&self) -> &Array2<Real> {
        &self.all_accepted_stats
    }

    pub fn all_sample_scores(&self) -> &[Real] {
        &self.all_sample_scores
    }

    pub fn all_accepted_scores(&self) -> &[Real] {
        &self.all_accepted_scores
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.elapsed
    }

    /// Posterior summary over the burn-in truncated accepted samples:
    /// per-parameter and per-statistic mean with the 2.5% and 97.5%
    /// quantiles.
    pub fn posterior(&self, burnin: usize) -> Result<Posterior> {
        if self.n_samples == 0 {
            return Err(Error::Uninitialized);
        }
        if burnin >= self.n_samples {
            return Err(Error::invalid(format!(
                "burn-in {} must be below the number of samples {}",
                burnin, self.n_samples
            )));
        }

        let summarize = |matrix: &Array2<Real>, names: &[String], prefix: &str| {
            (0..matrix.ncols())
                .map(|k| {
                    let mut column: Vec<Real> =
                        matrix.column(k).iter().skip(burnin).copied().collect();
                    let mean = column.iter().sum::<Real>() / column.len() as Real;
                    let lo = quantile(&mut column, 0.025);
                    let hi = quantile(&mut column, 0.975);
                    MarginalSummary {
                        name: names
                            .get(k)
                            .cloned()
                            .unwrap_or_else(|| format!("{}{:02}", prefix, k)),
                        mean,
                        lo,
                        hi,
                    }
                })
                .collect::<Vec<_>>()
        };

        Ok(Posterior {
            n_samples: self.n_samples,
            burnin,
            params: summarize(&self.all_accepted_params, &self.param_names, "p"),
            stats: summarize(&self.all_accepted_stats, &self.stat_names, "s"),
            observed_stats: self.observed_stats.clone(),
        })
    }
}

fn quantile(values: &mut [Real], q: Real) -> Real {
    let k = ((values.len() as Real) * q).floor() as usize;
    let k = k.min(values.len() - 1);
    let (_, kth, _) =
        values.select_nth_unstable_by(k, |a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    *kth
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarginalSummary {
    pub name: String,
    pub mean: Real,
    pub lo: Real,
    pub hi: Real,
}

/// Printable posterior summary of an LFMCMC run.
#[derive(Debug, Clone, PartialEq)]
pub struct Posterior {
    pub n_samples: usize,
    pub burnin: usize,
    pub params: Vec<MarginalSummary>,
    pub stats: Vec<MarginalSummary>,
    pub observed_stats: Vec<Real>,
}

impl fmt::Display for Posterior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "LFMCMC posterior ({} samples, {} burn-in)", self.n_samples, self.burnin)?;
        writeln!(f, "Parameters:")?;
        for p in &self.params {
            writeln!(
                f,
                "  {:<12} {:9.4} [{:9.4}, {:9.4}]",
                p.name, p.mean, p.lo, p.hi
            )?;
        }
        writeln!(f, "Statistics (observed):")?;
        for (k, s) in self.stats.iter().enumerate() {
            writeln!(
                f,
                "  {:<12} {:9.4} [{:9.4}, {:9.4}] ({:.4})",
                s.name,
                s.mean,
                s.lo,
                s.hi,
                self.observed_stats.get(k).copied().unwrap_or(f64::NAN)
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn kernels() {
        assert_eq!(kernel_uniform(&[0.0, 0.0], &[0.1, 0.0], 0.5), 1.0);
        assert_eq!(kernel_uniform(&[0.0, 0.0], &[1.0, 0.0], 0.5), 0.0);
        // Zero distance peaks at 1/sqrt(2 pi).
        assert_approx_eq!(kernel_gaussian(&[0.3], &[0.3], 0.5), 1.0 / SQRT_2PI, 1e-12);
        assert!(kernel_gaussian(&[0.0], &[2.0], 0.5) < kernel_gaussian(&[0.0], &[0.5], 0.5));
    }

    #[test]
    fn reflective_proposal_stays_in_bounds() {
        let proposal = make_proposal_norm_reflective(2.0, 0.0, 1.0);
        let mut rng = SmallRng::seed_from_u64(11);
        let mut new_params = vec![0.0; 3];
        let old = vec![0.5, 0.01, 0.99];
        for _ in 0..500 {
            proposal(&mut new_params, &old, &mut rng);
            for &p in &new_params {
                assert!((0.0..=1.0).contains(&p), "parameter {} escaped", p);
            }
        }
    }

    fn identity_chain(n_samples: usize, seed: u64) -> Lfmcmc<Vec<Real>> {
        // The "simulator" echoes its parameter scaled by 20, so the
        // gaussian kernel (unit bandwidth) pins the posterior tightly
        // around theta = 0.3.
        let mut mcmc = Lfmcmc::new(vec![0.3]);
        mcmc.set_simulation_fun(Arc::new(|params: &[Real], _rng: &mut SmallRng| {
            params.to_vec()
        }))
        .set_summary_fun(Arc::new(|stats: &mut Vec<Real>, data: &Vec<Real>| {
            stats.extend(data.iter().map(|x| 20.0 * x));
        }))
        .set_proposal_fun(make_proposal_norm_reflective(0.1, 0.0, 1.0))
        .set_kernel_fun(Arc::new(kernel_gaussian))
        .set_param_names(vec!["theta".to_string()]);
        mcmc.run(vec![0.9], n_samples, 0.1, Some(seed)).unwrap();
        mcmc
    }

    #[test]
    fn posterior_concentrates_on_observed() {
        let mcmc = identity_chain(2000, 42);
        let posterior = mcmc.posterior(500).unwrap();
        assert_eq!(posterior.params.len(), 1);
        assert_approx_eq!(posterior.params[0].mean, 0.3, 0.05);
        assert!(posterior.params[0].lo <= posterior.params[0].mean);
        assert!(posterior.params[0].hi >= posterior.params[0].mean);
    }

    #[test]
    fn burnin_bounds() {
        let mcmc = identity_chain(50, 7);
        assert!(mcmc.posterior(50).is_err());
        assert!(mcmc.posterior(51).is_err());
        // One remaining row still yields a summary.
        let posterior = mcmc.posterior(49).unwrap();
        assert_eq!(posterior.params.len(), 1);
        let text = format!("{}", posterior);
        assert!(text.contains("theta"));
    }

    #[test]
    fn acceptance_is_tracked() {
        let mcmc = identity_chain(200, 3);
        assert!(mcmc.all_sample_acceptance()[0]);
        let n_accepted = mcmc.all_sample_acceptance().iter().filter(|&&a| a).count();
        assert!(n_accepted > 1, "chain never moved");
        assert_eq!(mcmc.all_sample_params().nrows(), 200);
    }

    #[test]
    fn run_without_functions_fails() {
        let mut mcmc: Lfmcmc<Vec<Real>> = Lfmcmc::new(vec![]);
        assert!(mcmc.run(vec![0.5], 10, 0.1, Some(1)).is_err());
    }

    /// Attack rate of an SIR epidemic with per-contact infection
    /// probability `beta`, scaled up so the gaussian kernel separates
    /// nearby values.
    fn sir_attack_rate(beta: Real, seed: u64) -> Real {
        use crate::model::{Model, Prevalence};
        use crate::virus::Virus;

        let n = 1000;
        let mut model = Model::new();
        model.seed(404);
        model.agents_smallworld(n, 4, 0.0, false).unwrap();
        let mut virus = Virus::new("flu");
        virus.set_prob_infecting(beta.clamp(0.0, 1.0)).unwrap();
        virus.set_prob_recovery(0.3).unwrap();
        virus.set_state(Some(1), Some(2), Some(2));
        model.add_virus(virus, Prevalence::Count(10)).unwrap();
        model.run(20, seed).unwrap();
        let susceptible = model.db().today_total(0);
        10.0 * (n as Real - susceptible as Real) / n as Real
    }

    #[test]
    fn recovers_infection_probability_of_the_simulator() {
        let observed = sir_attack_rate(0.3, 999);

        let mut mcmc = Lfmcmc::new(vec![observed]);
        mcmc.set_simulation_fun(Arc::new(|params: &[Real], rng: &mut SmallRng| {
            let seed: u64 = rng.gen();
            vec![sir_attack_rate(params[0], seed)]
        }))
        .set_summary_fun(Arc::new(|stats: &mut Vec<Real>, data: &Vec<Real>| {
            stats.extend_from_slice(data);
        }))
        .set_proposal_fun(make_proposal_norm_reflective(0.1, 0.0, 1.0))
        .set_kernel_fun(Arc::new(kernel_gaussian))
        .set_param_names(vec!["beta".to_string()]);
        mcmc.run(vec![0.6], 200, 0.5, Some(2024)).unwrap();

        let posterior = mcmc.posterior(60).unwrap();
        let beta = &posterior.params[0];
        assert!(
            (beta.mean - 0.3).abs() < 0.12,
            "posterior mean {} too far from 0.3",
            beta.mean
        );
        assert!(
            mcmc.all_sample_acceptance().iter().filter(|&&a| a).count() > 10,
            "the chain barely moved"
        );
    }
}

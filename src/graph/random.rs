use crate::error::{Error, Result};
use crate::graph::{rewire_adjlist, AdjList};
use crate::prelude::Real;
use rand::Rng;
use rand_distr::{Binomial, Distribution};

/// Bernoulli graph G(n, p): the number of edges is drawn from
/// `Binomial(n(n-1)/d, p)` with `d = 1` for directed graphs and `d = 2`
/// otherwise, then placed uniformly at random rejecting self-loops.
pub fn rgraph_bernoulli<R: Rng>(
    n: usize,
    p: Real,
    directed: bool,
    rng: &mut R,
) -> Result<AdjList> {
    if n < 2 {
        return Err(Error::invalid(format!("need at least 2 nodes, got {}", n)));
    }
    if !(0.0..=1.0).contains(&p) {
        return Err(Error::invalid(format!("p = {} not in [0, 1]", p)));
    }

    let d = if directed { 1.0 } else { 2.0 };
    let trials = (n as f64 * (n as f64 - 1.0) / d) as u64;
    let binom = Binomial::new(trials, p)
        .map_err(|e| Error::invalid(format!("binomial({}, {}): {}", trials, p, e)))?;
    let m = binom.sample(rng) as usize;

    let mut source = Vec::with_capacity(m);
    let mut target = Vec::with_capacity(m);
    while source.len() < m {
        let a = rng.gen_range(0..n);
        let b = rng.gen_range(0..n);
        if a == b {
            continue;
        }
        source.push(a);
        target.push(b);
    }

    AdjList::from_edgelist(&source, &target, directed, Some(0), Some(n - 1))
}

/// Ring lattice: node i connects to `(i+1)..=(i+k)` modulo n.
pub fn rgraph_ring_lattice(n: usize, k: usize, directed: bool) -> Result<AdjList> {
    if k >= n {
        return Err(Error::invalid(format!(
            "k = {} must be smaller than n = {}",
            k, n
        )));
    }

    let mut source = Vec::with_capacity(n * k);
    let mut target = Vec::with_capacity(n * k);
    for i in 0..n {
        for j in 1..=k {
            source.push(i);
            target.push((i + j) % n);
        }
    }

    AdjList::from_edgelist(&source, &target, directed, Some(0), Some(n - 1))
}

/// Watts-Strogatz style small world: ring lattice followed by a
/// degree-preserving rewire of proportion `p`.
pub fn rgraph_smallworld<R: Rng>(
    n: usize,
    k: usize,
    p: Real,
    directed: bool,
    rng: &mut R,
) -> Result<AdjList> {
    let mut ring = rgraph_ring_lattice(n, k, directed)?;
    if k > 0 {
        rewire_adjlist(&mut ring, p, rng)?;
    }
    Ok(ring)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn ring_lattice_degrees() {
        let al = rgraph_ring_lattice(10, 2, false).unwrap();
        for i in 0..10 {
            assert_eq!(al.degree(i), 4, "node {}", i);
        }
        assert_eq!(al.ecount(), 20);
    }

    #[test]
    fn ring_lattice_rejects_large_k() {
        assert!(rgraph_ring_lattice(5, 5, false).is_err());
    }

    #[test]
    fn bernoulli_edge_count_is_plausible() {
        let mut rng = SmallRng::seed_from_u64(5);
        let al = rgraph_bernoulli(200, 0.05, false, &mut rng).unwrap();
        // E[m] = 0.05 * 200*199/2 = 995; loose 5-sigma band.
        assert!(al.ecount() > 800 && al.ecount() < 1200, "m = {}", al.ecount());
        for i in 0..200 {
            assert!(!al.neighbors(i).unwrap().contains_key(&i), "self-loop at {}", i);
        }
    }

    #[test]
    fn smallworld_preserves_degrees() {
        let mut rng = SmallRng::seed_from_u64(7);
        let before = rgraph_ring_lattice(30, 3, false).unwrap();
        let after = rgraph_smallworld(30, 3, 0.2, false, &mut rng).unwrap();
        for i in 0..30 {
            assert_eq!(before.degree(i), after.degree(i), "node {}", i);
        }
    }
}

use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::graph::AdjList;
use crate::prelude::Real;
use rand::Rng;

/// Draw an index in `0..cum.len()` from cumulative probabilities.
fn sample_cumulative<R: Rng>(cum: &[Real], rng: &mut R) -> usize {
    let r: Real = rng.gen();
    for (i, &w) in cum.iter().enumerate() {
        if r <= w {
            return i;
        }
    }
    cum.len() - 1
}

fn cumulative_degree_weights(degrees: &[usize]) -> Option<(Vec<usize>, Vec<Real>, Real)> {
    let mut non_isolates = Vec::new();
    let mut weights = Vec::new();
    let mut total = 0.0;
    for (i, &d) in degrees.iter().enumerate() {
        if d > 0 {
            non_isolates.push(i);
            weights.push(d as Real);
            total += d as Real;
        }
    }
    if non_isolates.is_empty() {
        return None;
    }
    let mut acc = 0.0;
    for w in weights.iter_mut() {
        acc += *w / total;
        *w = acc;
    }
    Some((non_isolates, weights, total))
}

/// Degree-preserving rewiring of an adjacency list.
///
/// Performs `⌊proportion * E⌋` swaps, each picking two distinct egos with
/// probability proportional to degree, one random incident edge of each,
/// and relinking `(a, a'), (b, b')` into `(a, b'), (b, a')`. A swap that
/// would introduce a self-loop or a parallel edge is skipped; for
/// undirected graphs the far ends are relinked symmetrically. The swap is
/// a relink of the maps, never a weight exchange, so every node's degree
/// is invariant.
pub fn rewire_adjlist<R: Rng>(al: &mut AdjList, proportion: Real, rng: &mut R) -> Result<()> {
    if !(0.0..=1.0).contains(&proportion) {
        return Err(Error::invalid(format!(
            "rewire proportion {} not in [0, 1]",
            proportion
        )));
    }

    let directed = al.is_directed();
    let degrees: Vec<usize> = (0..al.vcount()).map(|i| al.degree(i)).collect();
    let (non_isolates, cum, total) = cumulative_degree_weights(&degrees)
        .ok_or_else(|| Error::invalid("the graph is completely disconnected"))?;

    let n_edges = if directed { total } else { total / 2.0 };
    let mut nrewires = (proportion * n_edges).floor() as usize;

    let n = non_isolates.len();
    while nrewires > 0 {
        nrewires -= 1;

        let id0 = sample_cumulative(&cum, rng);
        let mut id1 = sample_cumulative(&cum, rng);
        if id1 == id0 {
            id1 += 1;
        }
        if id1 >= n {
            id1 = 0;
        }
        let (a, b) = (non_isolates[id0], non_isolates[id1]);
        if a == b {
            continue;
        }

        let dat = al.dat_mut();

        // Alters: uniformly chosen keys of each ego's map.
        let pick = |m: &std::collections::BTreeMap<usize, u32>, r: Real| -> usize {
            let k = ((m.len() as Real * r).floor() as usize).min(m.len() - 1);
            *m.keys().nth(k).unwrap_or(&0)
        };
        let ra: Real = rng.gen();
        let rb: Real = rng.gen();
        let a_alt = pick(&dat[a], ra);
        let b_alt = pick(&dat[b], rb);

        // Reject self-loops and parallel edges.
        if b_alt == a || a_alt == b || a_alt == b_alt {
            continue;
        }
        if dat[a].contains_key(&b_alt) || dat[b].contains_key(&a_alt) {
            continue;
        }

        let w_a = dat[a].remove(&a_alt).unwrap_or(1);
        let w_b = dat[b].remove(&b_alt).unwrap_or(1);
        dat[a].insert(b_alt, w_a);
        dat[b].insert(a_alt, w_b);

        if !directed {
            let w_alt_a = dat[a_alt].remove(&a).unwrap_or(1);
            let w_alt_b = dat[b_alt].remove(&b).unwrap_or(1);
            dat[a_alt].insert(b, w_alt_a);
            dat[b_alt].insert(a, w_alt_b);
        }
    }

    Ok(())
}

/// Degree-preserving rewiring of the live population's neighbor lists.
/// Same contract as [`rewire_adjlist`]; `directed` controls whether the
/// far ends are relinked symmetrically.
pub fn rewire_degseq<R: Rng>(
    population: &mut [Agent],
    directed: bool,
    proportion: Real,
    rng: &mut R,
) -> Result<()> {
    if !(0.0..=1.0).contains(&proportion) {
        return Err(Error::invalid(format!(
            "rewire proportion {} not in [0, 1]",
            proportion
        )));
    }

    let degrees: Vec<usize> = population.iter().map(|p| p.neighbors().len()).collect();
    let (non_isolates, cum, total) = cumulative_degree_weights(&degrees)
        .ok_or_else(|| Error::invalid("the graph is completely disconnected"))?;

    let n_edges = if directed { total } else { total / 2.0 };
    let mut nrewires = (proportion * n_edges).floor() as usize;

    let n = non_isolates.len();
    while nrewires > 0 {
        nrewires -= 1;

        let id0 = sample_cumulative(&cum, rng);
        let mut id1 = sample_cumulative(&cum, rng);
        if id1 == id0 {
            id1 += 1;
        }
        if id1 >= n {
            id1 = 0;
        }
        let (a, b) = (non_isolates[id0], non_isolates[id1]);
        if a == b {
            continue;
        }

        let pos_a = rng.gen_range(0..population[a].neighbors().len());
        let pos_b = rng.gen_range(0..population[b].neighbors().len());
        let a_alt = population[a].neighbors()[pos_a];
        let b_alt = population[b].neighbors()[pos_b];

        if b_alt == a || a_alt == b || a_alt == b_alt {
            continue;
        }
        if population[a].neighbors().contains(&b_alt)
            || population[b].neighbors().contains(&a_alt)
        {
            continue;
        }

        population[a].neighbors_mut()[pos_a] = b_alt;
        population[b].neighbors_mut()[pos_b] = a_alt;

        if !directed {
            if let Some(k) = population[a_alt].neighbors().iter().position(|&x| x == a) {
                population[a_alt].neighbors_mut()[k] = b;
            }
            if let Some(k) = population[b_alt].neighbors().iter().position(|&x| x == b) {
                population[b_alt].neighbors_mut()[k] = a;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::rgraph_ring_lattice;
    use rand::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn ring_rewire_preserves_degrees_and_symmetry() {
        let mut al = rgraph_ring_lattice(20, 4, false).unwrap();
        let before: Vec<usize> = (0..20).map(|i| al.degree(i)).collect();
        let neigh_before: Vec<BTreeSet<usize>> = (0..20)
            .map(|i| al.neighbors(i).unwrap().keys().copied().collect())
            .collect();

        let mut rng = SmallRng::seed_from_u64(12345);
        rewire_adjlist(&mut al, 0.5, &mut rng).unwrap();

        let mut changed = 0;
        for i in 0..20 {
            assert_eq!(al.degree(i), before[i], "degree of {}", i);
            let now: BTreeSet<usize> = al.neighbors(i).unwrap().keys().copied().collect();
            if now != neigh_before[i] {
                changed += 1;
            }
            for &j in &now {
                assert!(
                    al.neighbors(j).unwrap().contains_key(&i),
                    "{} -> {} but not {} -> {}",
                    i,
                    j,
                    j,
                    i
                );
                assert_ne!(i, j, "self-loop at {}", i);
            }
        }
        assert!(changed >= 1, "rewire(0.5) left the network untouched");
    }

    #[test]
    fn rewire_rejects_bad_proportion() {
        let mut al = rgraph_ring_lattice(10, 2, false).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        assert!(rewire_adjlist(&mut al, 1.5, &mut rng).is_err());
    }

    #[test]
    fn population_rewire_preserves_degrees() {
        let al = rgraph_ring_lattice(20, 4, false).unwrap();
        let mut pop: Vec<Agent> = (0..20).map(Agent::new).collect();
        for i in 0..20 {
            for (&j, _) in al.neighbors(i).unwrap() {
                pop[i].push_neighbor(j);
            }
        }
        let before: Vec<usize> = pop.iter().map(|p| p.neighbors().len()).collect();

        let mut rng = SmallRng::seed_from_u64(99);
        rewire_degseq(&mut pop, false, 0.5, &mut rng).unwrap();

        let mut changed = 0;
        for i in 0..20 {
            assert_eq!(pop[i].neighbors().len(), before[i]);
            let mine: BTreeSet<usize> = pop[i].neighbors().iter().copied().collect();
            let orig: BTreeSet<usize> = al.neighbors(i).unwrap().keys().copied().collect();
            if mine != orig {
                changed += 1;
            }
            for &j in &mine {
                assert!(pop[j].neighbors().contains(&i), "{} <-> {}", i, j);
            }
        }
        assert!(changed >= 1);
    }
}

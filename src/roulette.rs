use crate::prelude::Real;
use rand::Rng;

/// Probabilities closer to one than this are treated as certain.
const CERTAIN: Real = 1.0 - 1e-10;

/// Conditional weighted sampling.
///
/// Draws one of `None, Some(0), ..., Some(probs.len() - 1)` given that
/// either one or none of the independent Bernoulli trials succeeds. Each
/// `probs[i]` must lie in `[0, 1]`; the vector does not need to sum to one.
///
/// If any probability is (numerically) one, the draw is uniform over the
/// certain entries. Returns `None` when no trial succeeds.
pub fn roulette<R: Rng>(probs: &[Real], rng: &mut R) -> Option<usize> {
    if probs.is_empty() {
        return None;
    }

    let mut p_none = 1.0;
    let mut certain: Vec<usize> = Vec::new();
    for (i, &p) in probs.iter().enumerate() {
        p_none *= 1.0 - p;
        if p > CERTAIN {
            certain.push(i);
        }
    }

    let r: Real = rng.gen();
    if !certain.is_empty() {
        let which = (r * certain.len() as Real).floor() as usize;
        return Some(certain[which.min(certain.len() - 1)]);
    }

    // Probability that exactly trial i succeeds, and the normalizing
    // constant over the none-or-single event.
    let mut only: Vec<Real> = Vec::with_capacity(probs.len());
    let mut p_none_or_single = p_none;
    for &p in probs {
        let p_only = p * p_none / (1.0 - p);
        only.push(p_only);
        p_none_or_single += p_only;
    }

    let mut cumsum = p_none / p_none_or_single;
    if r < cumsum {
        return None;
    }

    for (i, &p_only) in only.iter().enumerate() {
        cumsum += p_only / p_none_or_single;
        if r < cumsum {
            return Some(i);
        }
    }

    // Rounding pushed the cumulative below one; the last entry takes it.
    Some(probs.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::prelude::*;

    #[test]
    fn empty_is_none() {
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(roulette(&[], &mut rng), None);
    }

    #[test]
    fn certain_single() {
        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(roulette(&[1.0], &mut rng), Some(0));
        }
    }

    #[test]
    fn certain_among_small() {
        let mut rng = SmallRng::seed_from_u64(9);
        let probs = [0.1, 1.0, 0.2];
        for _ in 0..100 {
            assert_eq!(roulette(&probs, &mut rng), Some(1));
        }
    }

    #[test]
    fn three_way_frequencies() {
        let mut rng = SmallRng::seed_from_u64(1234);
        let probs = [0.1, 0.1, 0.1];
        let n = 10_000;
        let mut counts = [0usize; 4];
        for _ in 0..n {
            match roulette(&probs, &mut rng) {
                None => counts[0] += 1,
                Some(i) => counts[i + 1] += 1,
            }
        }
        // P(none) = 0.9^3 = 0.729, P(i only) = 0.1 * 0.81, renormalized
        // over the none-or-single event.
        let f_none = counts[0] as Real / n as Real;
        assert_approx_eq!(f_none, 0.729 / 0.972, 0.02);
        for &c in &counts[1..] {
            assert_approx_eq!(c as Real / n as Real, 0.081 / 0.972, 0.01);
        }
    }

    #[test]
    fn respects_weights() {
        let mut rng = SmallRng::seed_from_u64(42);
        let probs = [0.05, 0.5];
        let (mut lo, mut hi) = (0usize, 0usize);
        for _ in 0..10_000 {
            match roulette(&probs, &mut rng) {
                Some(0) => lo += 1,
                Some(1) => hi += 1,
                _ => {}
            }
        }
        assert!(hi > 5 * lo, "hi={} lo={}", hi, lo);
    }
}

//! Mini-batch index sampling

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// How sample indices are drawn each iteration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// Fresh random subset every iteration
    #[default]
    Rand,
    /// One random subset drawn once and reused for the whole run
    #[serde(alias = "fix")]
    Fixed,
}

/// Draws `pick` distinct indices out of `nsamples` per iteration
#[derive(Debug)]
pub struct BatchSampler {
    kind: SamplerKind,
    nsamples: usize,
    pick: usize,
    rng: StdRng,
    fixed: Option<Vec<usize>>,
}

impl BatchSampler {
    pub fn new(kind: SamplerKind, nsamples: usize, pick: usize, seed: u64) -> Self {
        Self {
            kind,
            nsamples,
            pick: pick.min(nsamples),
            rng: StdRng::seed_from_u64(seed),
            fixed: None,
        }
    }

    /// Number of indices returned per iteration
    pub fn pick(&self) -> usize {
        self.pick
    }

    fn draw(&mut self) -> Vec<usize> {
        rand::seq::index::sample(&mut self.rng, self.nsamples, self.pick).into_vec()
    }

    /// Indices for the next iteration
    pub fn next_indices(&mut self) -> Vec<usize> {
        match self.kind {
            SamplerKind::Rand => self.draw(),
            SamplerKind::Fixed => {
                if self.fixed.is_none() {
                    self.fixed = Some(self.draw());
                }
                self.fixed.clone().unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_fixed_sampler_repeats() {
        let mut s = BatchSampler::new(SamplerKind::Fixed, 20, 4, 1);
        let first = s.next_indices();
        assert_eq!(first.len(), 4);
        for _ in 0..5 {
            assert_eq!(s.next_indices(), first);
        }
    }

    #[test]
    fn test_rand_sampler_varies_and_is_seeded() {
        let mut a = BatchSampler::new(SamplerKind::Rand, 50, 5, 3);
        let mut b = BatchSampler::new(SamplerKind::Rand, 50, 5, 3);
        let draws_a: Vec<_> = (0..10).map(|_| a.next_indices()).collect();
        let draws_b: Vec<_> = (0..10).map(|_| b.next_indices()).collect();
        assert_eq!(draws_a, draws_b);
        assert!(draws_a.iter().any(|d| d != &draws_a[0]));
    }

    #[test]
    fn test_pick_clamped_to_population() {
        let mut s = BatchSampler::new(SamplerKind::Rand, 3, 8, 0);
        assert_eq!(s.pick(), 3);
        let mut idx = s.next_indices();
        idx.sort_unstable();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_indices_distinct_and_in_range(n in 1usize..64, pick in 1usize..16, seed in any::<u64>()) {
            let mut s = BatchSampler::new(SamplerKind::Rand, n, pick, seed);
            let idx = s.next_indices();
            prop_assert_eq!(idx.len(), pick.min(n));
            prop_assert!(idx.iter().all(|&i| i < n));
            let unique: HashSet<_> = idx.iter().collect();
            prop_assert_eq!(unique.len(), idx.len());
        }
    }
}

// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

///
/// A deterministic shard sampler: shuffles the full example-id list once with a seeded
/// RNG, and serves prefix shards of that permutation. Successive-halving rungs use
/// growing fractions, so a candidate's smaller shard is always a prefix of its larger
/// one and cached results carry forward.
///
/// For a fixed seed the permutation is identical across runs and processes, which is
/// what makes cached evaluation results addressable across restarts.
///
#[derive(Clone, Debug)]
pub struct InstanceSampler {
    permutation: Vec<String>,
    seed: u64,
}

impl InstanceSampler {
    pub fn new(example_ids: Vec<String>, seed: u64) -> InstanceSampler {
        let mut permutation = example_ids;
        let mut rng = StdRng::seed_from_u64(seed);
        permutation.shuffle(&mut rng);
        InstanceSampler { permutation, seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn len(&self) -> usize {
        self.permutation.len()
    }

    ///
    /// The first `ceil(fraction * n)` ids of the seeded permutation. Fractions at or
    /// above 1.0 return the full permutation; positive fractions always return at least
    /// one id.
    ///
    pub fn sample(&self, fraction: f64) -> Vec<String> {
        if self.permutation.is_empty() {
            return Vec::new();
        }
        if fraction >= 1.0 {
            return self.permutation.clone();
        }
        if fraction <= 0.0 {
            return Vec::new();
        }
        let count = (fraction * self.permutation.len() as f64).ceil() as usize;
        self.permutation[..count.clamp(1, self.permutation.len())].to_vec()
    }
}

#[cfg(test)]
mod tests;

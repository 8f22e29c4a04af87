// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use crate::InstanceSampler;

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("example-{i}")).collect()
}

#[test]
fn same_seed_same_shards() {
    let a = InstanceSampler::new(ids(100), 42);
    let b = InstanceSampler::new(ids(100), 42);
    assert_eq!(a.seed(), 42);
    assert_eq!(a.sample(0.1), b.sample(0.1));
    assert_eq!(a.sample(1.0), b.sample(1.0));
}

#[test]
fn different_seeds_differ() {
    let a = InstanceSampler::new(ids(100), 42);
    let b = InstanceSampler::new(ids(100), 43);
    assert_ne!(a.sample(1.0), b.sample(1.0));
}

#[test]
fn smaller_shard_is_a_prefix_of_larger() {
    let sampler = InstanceSampler::new(ids(40), 7);
    let small = sampler.sample(0.25);
    let large = sampler.sample(0.5);
    assert_eq!(small.len(), 10);
    assert_eq!(large.len(), 20);
    assert_eq!(&large[..10], &small[..]);
}

#[test]
fn full_fraction_returns_all_ids_deterministically() {
    let sampler = InstanceSampler::new(ids(10), 3);
    let all = sampler.sample(1.0);
    assert_eq!(all.len(), 10);
    let mut sorted = all.clone();
    sorted.sort();
    assert_eq!(sorted, ids(10));
    assert_eq!(all, sampler.sample(1.0));
}

#[test]
fn fraction_rounds_up_and_is_never_empty_for_positive_fractions() {
    let sampler = InstanceSampler::new(ids(3), 0);
    assert_eq!(sampler.sample(0.01).len(), 1);
    assert_eq!(sampler.sample(0.34).len(), 2);
    assert!(sampler.sample(0.0).is_empty());
}

#[test]
fn empty_dataset() {
    let sampler = InstanceSampler::new(Vec::new(), 0);
    assert!(sampler.sample(1.0).is_empty());
    assert_eq!(sampler.len(), 0);
}

// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};

use hashing::Fingerprint;

///
/// Counters describing how the evolutionary search unfolded: how many children were
/// asked for, produced, admitted to the queue, and promoted past rung 0, plus the shape
/// of the lineage graph. Merged across islands and phases in the run outcome.
///
#[derive(Clone, Debug, Default)]
pub struct EvolutionStats {
    pub mutations_requested: usize,
    pub mutations_generated: usize,
    pub mutations_enqueued: usize,
    pub mutations_promoted: usize,
    pub unique_parents: usize,
    pub unique_children: usize,
    pub evolution_edges: usize,
    pub total_evaluations: usize,
    /// Per-island breakdown; empty for a single-island run's own snapshot.
    pub islands: Vec<EvolutionStats>,
}

impl EvolutionStats {
    pub fn combined(snapshots: Vec<EvolutionStats>) -> EvolutionStats {
        let mut combined = EvolutionStats::default();
        for snapshot in snapshots {
            combined.mutations_requested += snapshot.mutations_requested;
            combined.mutations_generated += snapshot.mutations_generated;
            combined.mutations_enqueued += snapshot.mutations_enqueued;
            combined.mutations_promoted += snapshot.mutations_promoted;
            combined.unique_parents += snapshot.unique_parents;
            combined.unique_children += snapshot.unique_children;
            combined.evolution_edges += snapshot.evolution_edges;
            combined.total_evaluations += snapshot.total_evaluations;
            if snapshot.islands.is_empty() {
                let mut leaf = snapshot;
                leaf.islands = Vec::new();
                combined.islands.push(leaf);
            } else {
                combined.islands.extend(snapshot.islands);
            }
        }
        combined
    }
}

///
/// The lineage graph: parent fingerprint → child fingerprints, stored outside the
/// candidates themselves (metadata carries only the parent edge, so the graph is acyclic
/// by construction).
///
#[derive(Default)]
pub struct Lineage {
    edges: HashMap<Fingerprint, HashSet<Fingerprint>>,
    promoted_children: HashSet<Fingerprint>,
    /// Consecutive children per parent that failed to improve on it.
    stagnation: HashMap<Fingerprint, usize>,
}

impl Lineage {
    pub fn record_edge(&mut self, parent: Fingerprint, child: Fingerprint) {
        self.edges.entry(parent).or_default().insert(child);
    }

    pub fn record_promotion(&mut self, child: Fingerprint) {
        self.promoted_children.insert(child);
    }

    /// Track whether `child_quality` improved on the parent by at least `min_improve`.
    pub fn record_child_outcome(
        &mut self,
        parent: Fingerprint,
        child_quality: f64,
        parent_quality: f64,
        min_improve: f64,
    ) {
        if child_quality >= parent_quality + min_improve {
            self.stagnation.insert(parent, 0);
        } else {
            *self.stagnation.entry(parent).or_insert(0) += 1;
        }
    }

    pub fn stalled(&self, parent: &Fingerprint, patience: usize) -> bool {
        self.stagnation
            .get(parent)
            .is_some_and(|&count| count >= patience)
    }

    pub fn unique_parents(&self) -> usize {
        self.edges.len()
    }

    pub fn unique_children(&self) -> usize {
        self.edges
            .values()
            .flatten()
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(HashSet::len).sum()
    }

    pub fn promoted_count(&self) -> usize {
        self.promoted_children.len()
    }
}

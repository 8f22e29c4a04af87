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

use std::collections::BTreeMap;

use itertools::Itertools;

use candidates::{Candidate, EvalResult, NEG_COST, QUALITY};
use hashing::Fingerprint;

///
/// A quality-diversity cell coordinate: which length bin, bullet-count bin, and feature
/// flag combination a candidate's text falls into.
///
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Descriptor {
    pub length_bin: usize,
    pub bullet_bin: usize,
    pub flags: Vec<bool>,
}

#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub candidate: Candidate,
    pub result: EvalResult,
    pub descriptor: Descriptor,
}

/// What an insert did: drives the orchestrator's novelty-rate accounting.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InsertOutcome {
    pub joined_pareto: bool,
    pub claimed_empty_cell: bool,
}

///
/// Selection structures over evaluated candidates: a Pareto frontier on the configured
/// objectives, and a QD grid that retains the highest-quality occupant of each
/// descriptor cell. The frontier drives selection pressure; the grid preserves
/// structurally diverse parents for reflection.
///
pub struct Archive {
    objectives: Vec<String>,
    bins_length: Vec<usize>,
    bins_bullets: Vec<usize>,
    flags: Vec<String>,
    pareto: Vec<ArchiveEntry>,
    qd_grid: BTreeMap<Descriptor, ArchiveEntry>,
}

impl Archive {
    pub fn new(bins_length: Vec<usize>, bins_bullets: Vec<usize>, flags: Vec<String>) -> Archive {
        Archive {
            objectives: vec![QUALITY.to_owned(), NEG_COST.to_owned()],
            bins_length,
            bins_bullets,
            flags,
            pareto: Vec::new(),
            qd_grid: BTreeMap::new(),
        }
    }

    pub fn with_objectives(mut self, objectives: Vec<String>) -> Archive {
        self.objectives = objectives;
        self
    }

    pub fn descriptor_for(&self, candidate: &Candidate) -> Descriptor {
        let text = &candidate.text;
        Descriptor {
            length_bin: bin_for(&self.bins_length, text.chars().count()),
            bullet_bin: bin_for(&self.bins_bullets, count_bullets(text)),
            flags: self.flags.iter().map(|flag| probe_flag(flag, text)).collect(),
        }
    }

    ///
    /// Insert one evaluated candidate. The frontier keeps no dominated entries, and ties
    /// on every objective keep the first entry seen. The grid cell is claimed when empty
    /// or when the newcomer beats the occupant on quality.
    ///
    pub fn insert(&mut self, candidate: Candidate, result: EvalResult) -> InsertOutcome {
        let descriptor = self.descriptor_for(&candidate);
        let entry = ArchiveEntry {
            candidate,
            result,
            descriptor: descriptor.clone(),
        };

        let point = self.objective_point(&entry.result);
        let mut outcome = InsertOutcome::default();

        let dominated_or_tied = self
            .pareto
            .iter()
            .any(|existing| dominates_or_equal(&self.objective_point(&existing.result), &point));
        if !dominated_or_tied {
            let existing_points: Vec<Vec<f64>> = self
                .pareto
                .iter()
                .map(|existing| self.objective_point(&existing.result))
                .collect();
            let mut idx = 0;
            self.pareto.retain(|_| {
                let keep = !dominates(&point, &existing_points[idx]);
                idx += 1;
                keep
            });
            self.pareto.push(entry.clone());
            outcome.joined_pareto = true;
        }

        match self.qd_grid.get(&descriptor) {
            None => {
                self.qd_grid.insert(descriptor, entry);
                outcome.claimed_empty_cell = true;
            }
            Some(occupant) if entry.result.quality() > occupant.result.quality() => {
                self.qd_grid.insert(descriptor, entry);
            }
            Some(_) => {}
        }
        outcome
    }

    pub fn batch_insert(&mut self, entries: Vec<(Candidate, EvalResult)>) -> Vec<InsertOutcome> {
        entries
            .into_iter()
            .map(|(candidate, result)| self.insert(candidate, result))
            .collect()
    }

    pub fn pareto_candidates(&self) -> Vec<Candidate> {
        self.pareto
            .iter()
            .map(|entry| entry.candidate.clone())
            .collect()
    }

    pub fn pareto_entries(&self) -> Vec<ArchiveEntry> {
        self.pareto.clone()
    }

    pub fn pareto_fingerprints(&self) -> Vec<Fingerprint> {
        self.pareto
            .iter()
            .map(|entry| entry.candidate.fingerprint())
            .collect()
    }

    ///
    /// Up to `limit` elites, one per non-empty cell in descriptor order, so that repeated
    /// samples rotate through structurally distinct candidates.
    ///
    pub fn sample_qd(&self, limit: usize) -> Vec<Candidate> {
        self.qd_grid
            .values()
            .take(limit)
            .map(|entry| entry.candidate.clone())
            .collect()
    }

    pub fn qd_filled_cells(&self) -> usize {
        self.qd_grid.len()
    }

    pub fn qd_total_cells(&self) -> usize {
        (self.bins_length.len() + 1) * (self.bins_bullets.len() + 1) * (1 << self.flags.len())
    }

    ///
    /// The frontier projected onto two objectives, for hypervolume computation.
    ///
    pub fn objective_points(&self, x: &str, y: &str) -> Vec<(f64, f64)> {
        self.pareto
            .iter()
            .map(|entry| {
                (
                    entry.result.objective(x).unwrap_or(0.0),
                    entry.result.objective(y).unwrap_or(0.0),
                )
            })
            .collect()
    }

    pub fn best_by(&self, objective: &str) -> Option<&ArchiveEntry> {
        self.pareto.iter().max_by(|a, b| {
            a.result
                .objective(objective)
                .unwrap_or(0.0)
                .total_cmp(&b.result.objective(objective).unwrap_or(0.0))
        })
    }

    fn objective_point(&self, result: &EvalResult) -> Vec<f64> {
        self.objectives
            .iter()
            .map(|objective| result.objective(objective).unwrap_or(0.0))
            .collect()
    }
}

/// a dominates b: at least as good everywhere, strictly better somewhere.
fn dominates(a: &[f64], b: &[f64]) -> bool {
    a.iter().zip_eq(b).all(|(x, y)| x >= y) && a.iter().zip_eq(b).any(|(x, y)| x > y)
}

fn dominates_or_equal(a: &[f64], b: &[f64]) -> bool {
    dominates(a, b) || a.iter().zip_eq(b).all(|(x, y)| x == y)
}

/// The index of the first boundary at or above `value`; one past the end when every
/// boundary is below it.
fn bin_for(boundaries: &[usize], value: usize) -> usize {
    boundaries
        .iter()
        .position(|&boundary| value <= boundary)
        .unwrap_or(boundaries.len())
}

fn count_bullets(text: &str) -> usize {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            trimmed.starts_with('-')
                || trimmed.starts_with('*')
                || trimmed.starts_with('•')
                || is_numbered_item(trimmed)
        })
        .count()
}

fn is_numbered_item(line: &str) -> bool {
    let Some(rest) = line.split_whitespace().next() else {
        return false;
    };
    let Some(marker) = rest.strip_suffix('.').or_else(|| rest.strip_suffix(')')) else {
        return false;
    };
    !marker.is_empty() && marker.chars().all(|c| c.is_ascii_digit())
}

fn probe_flag(flag: &str, text: &str) -> bool {
    let lowered = text.to_lowercase();
    match flag {
        "has_numbered_steps" => text.lines().any(|line| is_numbered_item(line.trim_start())),
        "mentions_format" => lowered.contains("format"),
        "has_examples" => lowered.contains("example"),
        // Unknown flags probe for their own name as a substring.
        other => lowered.contains(&other.to_lowercase()),
    }
}

#[cfg(test)]
mod tests;

// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeMap;

use candidates::{Candidate, EvalResult, NEG_COST, QUALITY};

use crate::Archive;

fn archive() -> Archive {
    Archive::new(
        vec![200, 500, 1000],
        vec![2, 5],
        vec!["has_numbered_steps".to_owned(), "mentions_format".to_owned()],
    )
}

fn result(quality: f64, neg_cost: f64) -> EvalResult {
    let mut objectives = BTreeMap::new();
    objectives.insert(QUALITY.to_owned(), quality);
    objectives.insert(NEG_COST.to_owned(), neg_cost);
    EvalResult {
        objectives,
        traces: Vec::new(),
        n_examples: 1,
        shard_fraction: Some(1.0),
        example_ids: vec!["e1".to_owned()],
    }
}

#[test]
fn pareto_keeps_mutually_nondominated_entries() {
    let mut archive = archive();
    archive.insert(Candidate::new("High quality, high cost."), result(0.8, -100.0));
    archive.insert(Candidate::new("Low quality, low cost."), result(0.6, -50.0));
    archive.insert(Candidate::new("Middle of the road."), result(0.7, -75.0));

    // None of the three dominates another on both objectives.
    let points: Vec<(f64, f64)> = archive.objective_points(QUALITY, NEG_COST);
    assert_eq!(points.len(), 3);
}

#[test]
fn dominated_entries_are_removed() {
    let mut archive = archive();
    archive.insert(Candidate::new("Weak."), result(0.5, -100.0));
    archive.insert(Candidate::new("Strictly better."), result(0.8, -50.0));

    let candidates = archive.pareto_candidates();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].text, "Strictly better.");
}

#[test]
fn dominated_newcomers_are_rejected() {
    let mut archive = archive();
    archive.insert(Candidate::new("Strong."), result(0.8, -50.0));
    let outcome = archive.insert(Candidate::new("Weak."), result(0.5, -100.0));
    assert!(!outcome.joined_pareto);
    assert_eq!(archive.pareto_candidates().len(), 1);
}

#[test]
fn ties_keep_the_first_seen() {
    let mut archive = archive();
    let first = archive.insert(Candidate::new("First."), result(0.8, -50.0));
    let second = archive.insert(Candidate::new("Second, same scores."), result(0.8, -50.0));
    assert!(first.joined_pareto);
    assert!(!second.joined_pareto);
    assert_eq!(archive.pareto_candidates()[0].text, "First.");
}

#[test]
fn pareto_closure_under_random_inserts() {
    let mut archive = archive();
    let grid = [
        (0.1, -10.0),
        (0.9, -200.0),
        (0.5, -50.0),
        (0.5, -40.0),
        (0.2, -5.0),
        (0.9, -190.0),
        (0.3, -40.0),
    ];
    for (i, (q, c)) in grid.iter().enumerate() {
        archive.insert(Candidate::new(format!("candidate {i}")), result(*q, *c));
    }
    let points = archive.objective_points(QUALITY, NEG_COST);
    for (i, a) in points.iter().enumerate() {
        for (j, b) in points.iter().enumerate() {
            if i != j {
                let strictly_dominates =
                    a.0 >= b.0 && a.1 >= b.1 && (a.0 > b.0 || a.1 > b.1);
                assert!(!strictly_dominates, "{a:?} dominates {b:?}");
            }
        }
    }
}

#[test]
fn qd_grid_keeps_best_per_cell() {
    let mut archive = archive();
    // Same descriptor cell: short prose, no bullets, no flags.
    let first = archive.insert(Candidate::new("Answer tersely."), result(0.4, -10.0));
    assert!(first.claimed_empty_cell);
    let second = archive.insert(Candidate::new("Answer kindly."), result(0.6, -10.0));
    assert!(!second.claimed_empty_cell);

    let elites = archive.sample_qd(10);
    assert_eq!(elites.len(), 1);
    assert_eq!(elites[0].text, "Answer kindly.");
}

#[test]
fn descriptors_separate_structure() {
    let archive = archive();
    let prose = archive.descriptor_for(&Candidate::new("Answer the question."));
    let listy = archive.descriptor_for(&Candidate::new(
        "Follow these steps:\n1. Read.\n2. Think.\n3. Answer in the required format.",
    ));
    assert_ne!(prose, listy);
    assert!(listy.flags[0], "numbered steps flag");
    assert!(listy.flags[1], "format flag");
}

#[test]
fn qd_total_cells_counts_the_full_grid() {
    let archive = archive();
    // 4 length bins x 3 bullet bins x 2^2 flag combinations.
    assert_eq!(archive.qd_total_cells(), 48);
}

#[test]
fn configurable_objectives() {
    let mut archive = archive().with_objectives(vec![QUALITY.to_owned()]);
    archive.insert(Candidate::new("Good."), result(0.8, -100.0));
    archive.insert(Candidate::new("Cheap."), result(0.6, -50.0));
    // On quality alone, the cheaper candidate is dominated outright.
    assert_eq!(archive.pareto_candidates().len(), 1);
    assert_eq!(archive.pareto_candidates()[0].text, "Good.");
}

#[test]
fn best_by_objective() {
    let mut archive = archive();
    archive.insert(Candidate::new("Good."), result(0.8, -100.0));
    archive.insert(Candidate::new("Cheap."), result(0.6, -50.0));
    assert_eq!(
        archive.best_by(QUALITY).unwrap().candidate.text,
        "Good."
    );
    assert_eq!(archive.best_by(NEG_COST).unwrap().candidate.text, "Cheap.");
}

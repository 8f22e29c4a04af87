// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::HashSet;

use crate::{compute_hypervolume_2d, EpochMetrics, StopGovernor, StopGovernorConfig};

fn frontier(ids: &[&str]) -> HashSet<String> {
    ids.iter().map(|s| (*s).to_owned()).collect()
}

fn flat_epoch(round_num: usize) -> EpochMetrics {
    EpochMetrics {
        round_num,
        hypervolume: 1.0,
        new_evaluations: 10,
        best_quality: 0.5,
        best_cost: -100.0,
        frontier_ids: frontier(&["a", "b"]),
        qd_filled_cells: 4,
        qd_total_cells: 48,
        qd_novelty_rate: 0.0,
        total_tokens_spent: 1000,
    }
}

#[test]
fn stops_after_hysteresis_window_of_flat_epochs() {
    let mut governor = StopGovernor::new(StopGovernorConfig::default());
    let mut stopped_at = None;
    for round in 1..=10 {
        governor.update(flat_epoch(round));
        if governor.should_stop() {
            stopped_at = Some(round);
            break;
        }
    }
    let stopped_at = stopped_at.expect("flat epochs must eventually stop the run");
    // Scores only start at the second epoch, so the window cannot close before then.
    assert!(stopped_at > 5, "stopped too early at {stopped_at}");
    assert!(stopped_at <= 7, "stopped too late at {stopped_at}");
}

#[test]
fn improving_quality_keeps_the_run_alive() {
    let mut governor = StopGovernor::new(StopGovernorConfig::default());
    for round in 1..=10 {
        let mut epoch = flat_epoch(round);
        epoch.best_quality = 0.1 * round as f64;
        epoch.hypervolume = epoch.best_quality * 100.0;
        epoch.frontier_ids = frontier(&[&format!("gen-{round}")]);
        governor.update(epoch);
        assert!(!governor.should_stop(), "stopped during improvement at {round}");
    }
}

#[test]
fn a_single_improving_epoch_resets_the_hysteresis_counter() {
    let mut governor = StopGovernor::new(StopGovernorConfig::default());
    for round in 1..=4 {
        governor.update(flat_epoch(round));
        assert!(!governor.should_stop());
    }
    // A real jump in quality revives every EWMA-smoothed signal.
    let mut improving = flat_epoch(5);
    improving.best_quality = 0.9;
    improving.frontier_ids = frontier(&["c"]);
    governor.update(improving);
    assert!(!governor.should_stop());

    // The counter starts over: four more flat epochs are not enough.
    for round in 6..=9 {
        let mut epoch = flat_epoch(round);
        epoch.best_quality = 0.9;
        epoch.frontier_ids = frontier(&["c"]);
        governor.update(epoch);
        assert!(!governor.should_stop(), "stopped at {round}");
    }
    assert_eq!(governor.epochs_recorded(), 9);
}

#[test]
fn no_improvement_hard_cap() {
    // Make the hysteresis path unreachable so only the hard cap can fire.
    let config = StopGovernorConfig {
        stop_threshold: 0.0,
        max_no_improvement_epochs: 3,
        ..StopGovernorConfig::default()
    };
    let mut governor = StopGovernor::new(config);
    let mut stopped_at = None;
    for round in 1..=10 {
        governor.update(flat_epoch(round));
        if governor.should_stop() {
            stopped_at = Some(round);
            break;
        }
    }
    // Improvement deltas also start at the second epoch.
    assert_eq!(stopped_at, Some(4));
}

#[test]
fn reset_clears_history() {
    let mut governor = StopGovernor::new(StopGovernorConfig::default());
    for round in 1..=8 {
        governor.update(flat_epoch(round));
        let _ = governor.should_stop();
    }
    governor.reset();
    assert_eq!(governor.epochs_recorded(), 0);
    governor.update(flat_epoch(1));
    assert!(!governor.should_stop());
}

#[test]
fn hypervolume_of_empty_frontier_is_zero() {
    assert_eq!(compute_hypervolume_2d(&[], (0.0, 0.0)), 0.0);
}

#[test]
fn hypervolume_single_point() {
    // neg_cost is negative, so a reference below the frontier is needed for area.
    let hv = compute_hypervolume_2d(&[(0.8, -50.0)], (0.0, -100.0));
    assert!((hv - 0.8 * 50.0).abs() < 1e-9);
}

#[test]
fn hypervolume_staircase() {
    let points = [(0.8, -100.0), (0.6, -50.0)];
    let hv = compute_hypervolume_2d(&points, (0.0, -200.0));
    // 0.8 * (200 - 100) + 0.6 * (100 - 50).
    assert!((hv - (0.8 * 100.0 + 0.6 * 50.0)).abs() < 1e-9);
}

#[test]
fn hypervolume_nondecreasing_under_nondominated_insert() {
    let reference = (0.0, -200.0);
    let base = vec![(0.8, -100.0), (0.6, -50.0)];
    let hv_base = compute_hypervolume_2d(&base, reference);

    let mut extended = base.clone();
    extended.push((0.7, -75.0));
    let hv_extended = compute_hypervolume_2d(&extended, reference);
    assert!(hv_extended >= hv_base);
}

#[test]
fn hypervolume_unchanged_under_dominated_insert() {
    let reference = (0.0, -200.0);
    let base = vec![(0.8, -100.0), (0.6, -50.0)];
    let hv_base = compute_hypervolume_2d(&base, reference);

    let mut extended = base.clone();
    extended.push((0.5, -150.0));
    let hv_extended = compute_hypervolume_2d(&extended, reference);
    assert!((hv_extended - hv_base).abs() < 1e-12);
}

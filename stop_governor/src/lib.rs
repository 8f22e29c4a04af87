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

use std::collections::HashSet;

///
/// Metrics collected during one optimization epoch, fed to the StopGovernor after each
/// round.
///
#[derive(Clone, Debug)]
pub struct EpochMetrics {
    pub round_num: usize,
    pub hypervolume: f64,
    pub new_evaluations: usize,
    pub best_quality: f64,
    /// Negative tokens: higher is better.
    pub best_cost: f64,
    pub frontier_ids: HashSet<String>,
    pub qd_filled_cells: usize,
    pub qd_total_cells: usize,
    /// Fraction of the epoch's evaluations that landed in previously empty QD cells.
    pub qd_novelty_rate: f64,
    pub total_tokens_spent: u64,
}

#[derive(Clone, Debug)]
pub struct StopGovernorConfig {
    /// EWMA smoothing parameter.
    pub alpha: f64,
    /// Require this many consecutive epochs below threshold before stopping.
    pub hysteresis_window: usize,
    /// Overall stop threshold; lower makes stopping easier.
    pub stop_threshold: f64,
    // Minimum useful improvement per signal.
    pub tau_hv: f64,
    pub tau_quality: f64,
    pub tau_quality_relative: f64,
    pub tau_cost: f64,
    pub tau_qd_novelty: f64,
    pub tau_roi: f64,
    /// Frontiers at or above this Jaccard similarity count as stable.
    pub min_jaccard_for_stable: f64,
    // Signal weights for max aggregation.
    pub weight_hv: f64,
    pub weight_quality: f64,
    pub weight_cost: f64,
    pub weight_qd: f64,
    pub weight_roi: f64,
    /// Exponent applied to (1 - stability).
    pub stability_penalty_beta: f64,
    /// Hard cap: stop after this many epochs without quality improvement.
    pub max_no_improvement_epochs: usize,
}

impl Default for StopGovernorConfig {
    fn default() -> StopGovernorConfig {
        StopGovernorConfig {
            alpha: 0.3,
            hysteresis_window: 5,
            stop_threshold: 0.15,
            tau_hv: 1e-5,
            tau_quality: 1e-3,
            tau_quality_relative: 0.01,
            tau_cost: 5.0,
            tau_qd_novelty: 0.03,
            tau_roi: 1e-6,
            min_jaccard_for_stable: 0.85,
            weight_hv: 1.0,
            weight_quality: 1.0,
            weight_cost: 0.6,
            weight_qd: 0.7,
            weight_roi: 0.5,
            stability_penalty_beta: 0.5,
            max_no_improvement_epochs: 12,
        }
    }
}

/// The per-signal values behind a stop decision, clamped to [0, 1]; 1 means "keep
/// going".
#[derive(Clone, Copy, Debug, Default)]
pub struct Signals {
    pub s_hv: f64,
    pub s_quality: f64,
    pub s_cost: f64,
    pub s_qd: f64,
    pub s_roi: f64,
    pub s_stability: f64,
    pub jaccard: f64,
    pub stop_score: f64,
}

///
/// Monitors optimization progress and decides when to stop.
///
/// Uses multiple signals (hypervolume rate, quality delta, cost delta, QD novelty, ROI)
/// smoothed with an EWMA, penalized by frontier stability, and gated by hysteresis so a
/// single flat epoch never ends a run.
///
pub struct StopGovernor {
    config: StopGovernorConfig,
    epochs: Vec<EpochMetrics>,
    ewma_hv_rate: f64,
    ewma_quality_delta: f64,
    ewma_cost_delta: f64,
    ewma_roi: f64,
    epochs_below_threshold: usize,
    epochs_no_improvement: usize,
    last_best_quality: f64,
}

impl StopGovernor {
    pub fn new(config: StopGovernorConfig) -> StopGovernor {
        StopGovernor {
            config,
            epochs: Vec::new(),
            ewma_hv_rate: 0.0,
            ewma_quality_delta: 0.0,
            ewma_cost_delta: 0.0,
            ewma_roi: 0.0,
            epochs_below_threshold: 0,
            epochs_no_improvement: 0,
            last_best_quality: 0.0,
        }
    }

    /// Record new epoch metrics and update EWMA state.
    pub fn update(&mut self, metrics: EpochMetrics) {
        if let Some(prev) = self.epochs.last() {
            let delta_hv = metrics.hypervolume - prev.hypervolume;
            let hv_rate = delta_hv / metrics.new_evaluations.max(1) as f64;
            let delta_quality = metrics.best_quality - prev.best_quality;
            let delta_cost = metrics.best_cost - prev.best_cost;
            let tokens_delta = metrics.total_tokens_spent.saturating_sub(prev.total_tokens_spent);
            let roi = delta_hv / tokens_delta.max(1) as f64;

            let alpha = self.config.alpha;
            self.ewma_hv_rate = alpha * hv_rate + (1.0 - alpha) * self.ewma_hv_rate;
            self.ewma_quality_delta = alpha * delta_quality + (1.0 - alpha) * self.ewma_quality_delta;
            self.ewma_cost_delta = alpha * delta_cost + (1.0 - alpha) * self.ewma_cost_delta;
            self.ewma_roi = alpha * roi + (1.0 - alpha) * self.ewma_roi;

            if delta_quality > self.config.tau_quality {
                self.epochs_no_improvement = 0;
            } else {
                self.epochs_no_improvement += 1;
            }
        }
        self.last_best_quality = metrics.best_quality;
        self.epochs.push(metrics);
    }

    /// Compute normalized 0-1 signals for each stopping criterion.
    pub fn compute_signals(&self) -> Signals {
        if self.epochs.len() < 2 {
            return Signals {
                s_hv: 1.0,
                s_quality: 1.0,
                s_cost: 1.0,
                s_qd: 1.0,
                s_roi: 1.0,
                s_stability: 0.0,
                jaccard: 0.0,
                stop_score: 1.0,
            };
        }
        let curr = &self.epochs[self.epochs.len() - 1];
        let prev = &self.epochs[self.epochs.len() - 2];
        let config = &self.config;

        let s_hv = normalized(self.ewma_hv_rate, config.tau_hv);

        let s_quality = if config.tau_quality > 0.0 && config.tau_quality_relative > 0.0 {
            let absolute = self.ewma_quality_delta / config.tau_quality;
            let relative = (self.ewma_quality_delta / self.last_best_quality.max(0.01))
                / config.tau_quality_relative;
            // Whichever threshold is more lenient wins: a large model plateauing at a high
            // score still registers small relative motion.
            absolute.max(relative).clamp(0.0, 1.0)
        } else {
            normalized(self.ewma_quality_delta, config.tau_quality)
        };

        let s_cost = normalized(self.ewma_cost_delta, config.tau_cost);
        let s_qd = normalized(curr.qd_novelty_rate, config.tau_qd_novelty);
        let s_roi = normalized(self.ewma_roi, config.tau_roi);

        let jaccard = jaccard_similarity(&prev.frontier_ids, &curr.frontier_ids);
        let s_stability = if jaccard >= config.min_jaccard_for_stable {
            jaccard
        } else {
            0.0
        };

        let max_signal = [
            config.weight_hv * s_hv,
            config.weight_quality * s_quality,
            config.weight_cost * s_cost,
            config.weight_qd * s_qd,
            config.weight_roi * s_roi,
        ]
        .into_iter()
        .fold(f64::NEG_INFINITY, f64::max);

        let stability_penalty = (1.0 - s_stability).powf(config.stability_penalty_beta);
        let stop_score = max_signal * stability_penalty;

        Signals {
            s_hv,
            s_quality,
            s_cost,
            s_qd,
            s_roi,
            s_stability,
            jaccard,
            stop_score,
        }
    }

    ///
    /// Whether optimization should stop. Flips to true only after `hysteresis_window`
    /// consecutive epochs below `stop_threshold`, or `max_no_improvement_epochs` epochs
    /// without a quality gain above `tau_quality`.
    ///
    pub fn should_stop(&mut self) -> bool {
        if self.epochs.len() < 2 {
            return false;
        }
        let signals = self.compute_signals();
        if signals.stop_score < self.config.stop_threshold {
            self.epochs_below_threshold += 1;
        } else {
            self.epochs_below_threshold = 0;
        }

        let hard_stop = self.epochs_no_improvement >= self.config.max_no_improvement_epochs;
        let hysteresis_stop = self.epochs_below_threshold >= self.config.hysteresis_window;

        if hard_stop {
            log::debug!(
                "Stopping: no quality improvement for {} epochs",
                self.epochs_no_improvement
            );
        } else if hysteresis_stop {
            log::debug!(
                "Stopping: stop score below {} for {} epochs",
                self.config.stop_threshold,
                self.epochs_below_threshold
            );
        }
        hard_stop || hysteresis_stop
    }

    pub fn epochs_recorded(&self) -> usize {
        self.epochs.len()
    }

    pub fn reset(&mut self) {
        self.epochs.clear();
        self.ewma_hv_rate = 0.0;
        self.ewma_quality_delta = 0.0;
        self.ewma_cost_delta = 0.0;
        self.ewma_roi = 0.0;
        self.epochs_below_threshold = 0;
        self.epochs_no_improvement = 0;
        self.last_best_quality = 0.0;
    }
}

fn normalized(value: f64, tau: f64) -> f64 {
    if tau > 0.0 {
        (value / tau).clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

///
/// The area dominated by a (quality, neg_cost) frontier relative to a reference point:
/// filter dominated points, sort by quality descending, and integrate the staircase.
/// Both coordinates are maximized.
///
pub fn compute_hypervolume_2d(points: &[(f64, f64)], reference: (f64, f64)) -> f64 {
    if points.is_empty() {
        return 0.0;
    }

    let mut pareto: Vec<(f64, f64)> = Vec::new();
    for &(q, c) in points {
        let dominated = pareto
            .iter()
            .any(|&(pq, pc)| pq >= q && pc >= c && (pq > q || pc > c));
        if !dominated {
            pareto.retain(|&(pq, pc)| !(q >= pq && c >= pc && (q > pq || c > pc)));
            pareto.push((q, c));
        }
    }
    pareto.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    let (ref_q, ref_c) = reference;
    let mut hv = 0.0;
    let mut prev_c = ref_c;
    for (q, c) in pareto {
        if q > ref_q && c > prev_c {
            hv += (q - ref_q) * (c - prev_c);
            prev_c = c;
        }
    }
    hv
}

#[cfg(test)]
mod tests;

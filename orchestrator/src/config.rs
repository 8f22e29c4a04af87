// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::time::Duration;

///
/// All tunables for one optimization run. `validate` is called before any model call is
/// made: configuration problems are the one class of error that fails fast.
///
#[derive(Clone, Debug)]
pub struct Config {
    /// Successive-halving rungs as dataset fractions, ascending and ending at 1.0.
    pub shards: Vec<f64>,
    /// Maximum concurrent task-runner calls per candidate evaluation.
    pub eval_concurrency: usize,
    /// Number of independent populations; 1 disables migration entirely.
    pub n_islands: usize,
    /// Candidates evaluated per round.
    pub batch_size: usize,
    /// Children requested from one reflection call.
    pub max_mutations_per_round: usize,
    /// Launch another reflection call while fewer than this many children are in flight.
    pub mutation_buffer_min: usize,
    /// Upper bound on queued candidates; children beyond it are dropped.
    pub queue_limit: usize,
    /// The promotion quantile within a rung cohort.
    pub cohort_quantile: f64,
    /// Margin a candidate must clear above the cohort quantile to advance.
    pub eps_improve: f64,
    /// The objective promotions are decided on.
    pub promote_objective: String,
    /// Also promote candidates whose lineage has stalled, to escape local minima.
    pub enable_rung_convergence: bool,
    /// Consecutive non-improving children before a lineage counts as stalled.
    pub lineage_patience: usize,
    /// Improvement a child must show over its parent to reset the stall counter.
    pub lineage_min_improve: f64,
    /// Stop as soon as any candidate reaches this quality on the terminal shard.
    pub target_quality: Option<f64>,
    /// Rounds between migrations in multi-island mode.
    pub migration_period: usize,
    /// Pareto candidates each island sends per migration.
    pub migration_k: usize,
    /// Per-call timeout for the task runner.
    pub eval_timeout: Option<Duration>,
    pub qd_bins_length: Vec<usize>,
    pub qd_bins_bullets: Vec<usize>,
    pub qd_flags: Vec<String>,
    pub cache_path: PathBuf,
    pub log_path: Option<PathBuf>,
    /// One of debug, info, warning, error, critical.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            shards: vec![0.1, 0.25, 1.0],
            eval_concurrency: 16,
            n_islands: 1,
            batch_size: 8,
            max_mutations_per_round: 4,
            mutation_buffer_min: 2,
            queue_limit: 64,
            cohort_quantile: 0.5,
            eps_improve: 0.0,
            promote_objective: candidates::QUALITY.to_owned(),
            enable_rung_convergence: false,
            lineage_patience: 3,
            lineage_min_improve: 0.01,
            target_quality: None,
            migration_period: 1,
            migration_k: 2,
            eval_timeout: Some(Duration::from_secs(120)),
            qd_bins_length: vec![200, 500, 1000, 2000],
            qd_bins_bullets: vec![2, 5, 10],
            qd_flags: vec![
                "has_numbered_steps".to_owned(),
                "mentions_format".to_owned(),
                "has_examples".to_owned(),
            ],
            cache_path: PathBuf::from(".optimizer/cache"),
            log_path: None,
            log_level: "warning".to_owned(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.shards.is_empty() {
            return Err("shards must contain at least one fraction".to_owned());
        }
        for window in self.shards.windows(2) {
            if window[0] >= window[1] {
                return Err(format!(
                    "shards must be strictly ascending, got {:?}",
                    self.shards
                ));
            }
        }
        for &shard in &self.shards {
            if shard <= 0.0 || shard > 1.0 {
                return Err(format!("shard fractions must be in (0, 1], got {shard}"));
            }
        }
        if (self.shards[self.shards.len() - 1] - 1.0).abs() > f64::EPSILON {
            return Err("the terminal shard must be the full dataset (1.0)".to_owned());
        }
        if self.eval_concurrency == 0 {
            return Err("eval_concurrency must be at least 1".to_owned());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_owned());
        }
        if self.n_islands == 0 {
            return Err("n_islands must be at least 1".to_owned());
        }
        if !(0.0..=1.0).contains(&self.cohort_quantile) {
            return Err(format!(
                "cohort_quantile must be in [0, 1], got {}",
                self.cohort_quantile
            ));
        }
        if let Some(target) = self.target_quality {
            if !(0.0..=1.0).contains(&target) {
                return Err(format!("target_quality must be in [0, 1], got {target}"));
            }
        }
        Ok(())
    }

    ///
    /// The migration cadence used when this config drives more than one island:
    /// every `max(1, n_islands / 2)` rounds.
    ///
    pub fn tuned_migration_period(&self) -> usize {
        (self.n_islands / 2).max(1)
    }
}

#[cfg(test)]
mod config_tests {
    use super::Config;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_empty_shards() {
        let config = Config {
            shards: vec![],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_ascending_shards() {
        let config = Config {
            shards: vec![0.5, 0.25, 1.0],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shards_not_ending_at_one() {
        let config = Config {
            shards: vec![0.1, 0.5],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_quantile() {
        let config = Config {
            cohort_quantile: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let config = Config {
            eval_concurrency: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn migration_period_scales_with_island_count() {
        for (n_islands, period) in [(1, 1), (2, 1), (4, 2), (8, 4)] {
            let config = Config {
                n_islands,
                ..Config::default()
            };
            assert_eq!(config.tuned_migration_period(), period);
        }
    }
}

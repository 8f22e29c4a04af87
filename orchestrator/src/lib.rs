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

mod config;
mod evolution;
mod fd_limit;
mod islands;
#[allow(clippy::module_inception)]
mod orchestrator;

pub use crate::config::Config;
pub use crate::evolution::EvolutionStats;
pub use crate::fd_limit::FdLimitGuard;
pub use crate::orchestrator::{IslandContext, Orchestrator, Shutdown};

use std::sync::Arc;

use archive::{Archive, ArchiveEntry};
use cache::ResultCache;
use candidates::{Candidate, Source};
use evaluator::{Evaluator, TaskRunner};
use mutator::{ChatModel, ModelContext, MutationConfig, Mutator};
use sampler::InstanceSampler;
use stop_governor::{StopGovernor, StopGovernorConfig};
use task_executor::{recommended_worker_count, Executor};

/// How much of the evaluation budget phase 1 of staged optimization receives.
const PHASE1_BUDGET_FRACTION: f64 = 0.7;
const PHASE1_DEFAULT_ROUNDS: usize = 10;
/// Phase-2 round caps for single- and multi-island mode.
const PHASE2_ROUNDS: usize = 1;
const PHASE2_ROUNDS_MULTI_ISLAND: usize = 5;
/// How many phase-1 elites seed phase 2, and the temperature they start from.
const PHASE2_SEED_COUNT: usize = 5;
const PHASE2_SEED_TEMPERATURE: f64 = 0.5;

///
/// Limits on one `optimize` call. Budgets are independent: whichever is exhausted first
/// ends the run. `enable_auto_stop` installs the convergence governor;
/// `staged_temperature` splits the run into a prompt phase and a temperature phase.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct RunBudget {
    pub max_rounds: Option<usize>,
    pub max_evaluations: Option<usize>,
    pub enable_auto_stop: bool,
    pub staged_temperature: bool,
}

///
/// What an optimization run produced: the Pareto frontier (with and without full
/// results), the QD elites, and evolution statistics. Staged runs additionally report
/// the phase-1 frontier and per-phase statistics.
///
#[derive(Clone, Debug)]
pub struct OptimizationOutcome {
    pub pareto: Vec<Candidate>,
    pub pareto_entries: Vec<ArchiveEntry>,
    pub qd_elites: Vec<Candidate>,
    pub evolution_stats: EvolutionStats,
    pub total_candidates: usize,
    pub phase1_pareto: Option<Vec<Candidate>>,
    pub phase1_evolution_stats: Option<EvolutionStats>,
    pub phase2_evolution_stats: Option<EvolutionStats>,
}

///
/// An owned runtime sized for the configured evaluation fan-out, following the worker
/// recommendation: async workers bounded by core count, with blocking capacity for
/// cache I/O on top.
///
pub fn owned_executor(config: &Config) -> Result<Executor, String> {
    let workers = recommended_worker_count(config.eval_concurrency);
    Executor::new_owned(workers, workers * 2)
}

///
/// The top-level harness: owns the cache, the model context, and the shutdown handle,
/// and builds one orchestrator per island (and per phase, in staged mode).
///
/// The task runner and reflection model are external collaborators; everything else is
/// constructed here from the config.
///
pub struct Optimizer {
    config: Arc<Config>,
    executor: Executor,
    cache: ResultCache,
    task_runner: Arc<dyn TaskRunner>,
    reflection_model: Arc<dyn ChatModel>,
    model_context: Arc<ModelContext>,
    example_ids: Vec<String>,
    sampler_seed: u64,
    reflection_temperature: Option<f64>,
    shutdown: Shutdown,
    _fd_guard: FdLimitGuard,
}

impl std::fmt::Debug for Optimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Optimizer").finish_non_exhaustive()
    }
}

impl Optimizer {
    pub fn new(
        config: Config,
        executor: Executor,
        task_runner: Arc<dyn TaskRunner>,
        reflection_model: Arc<dyn ChatModel>,
        example_ids: Vec<String>,
        sampler_seed: u64,
    ) -> Result<Optimizer, String> {
        config.validate()?;
        if example_ids.is_empty() {
            return Err("dataset must contain at least one example".to_owned());
        }
        logging::init(logging::level_for(&config.log_level), config.log_path.as_deref())?;
        let fd_guard = FdLimitGuard::raise();
        let cache = ResultCache::new(&config.cache_path, executor.clone())?;
        Ok(Optimizer {
            config: Arc::new(config),
            executor,
            cache,
            task_runner,
            reflection_model,
            model_context: ModelContext::new(),
            example_ids,
            sampler_seed,
            reflection_temperature: None,
            shutdown: Shutdown::new(),
            _fd_guard: fd_guard,
        })
    }

    pub fn with_reflection_temperature(mut self, temperature: Option<f64>) -> Optimizer {
        self.reflection_temperature = temperature;
        self
    }

    /// The run-level cancellation handle: trigger it from a signal handler and the run
    /// checkpoints at the next round boundary and returns.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn model_context(&self) -> &Arc<ModelContext> {
        &self.model_context
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    ///
    /// Search for better instructions starting from `seeds`, within `budget`.
    ///
    pub async fn optimize(
        &self,
        seeds: Vec<Candidate>,
        budget: RunBudget,
    ) -> Result<OptimizationOutcome, String> {
        if seeds.is_empty() {
            return Err("at least one seed candidate is required".to_owned());
        }
        if budget.staged_temperature && self.model_context.temperature_supported() {
            return self.optimize_staged(seeds, budget).await;
        }
        let seeds = self.normalize_seeds(seeds, Source::Seed, false);
        if self.config.n_islands > 1 {
            self.optimize_islands(seeds, budget, false).await
        } else {
            self.optimize_single(seeds, budget, false).await
        }
    }

    async fn optimize_single(
        &self,
        seeds: Vec<Candidate>,
        budget: RunBudget,
        temperature_mutations: bool,
    ) -> Result<OptimizationOutcome, String> {
        let mut orchestrator = self.build_orchestrator(
            self.config.clone(),
            None,
            budget.enable_auto_stop,
            temperature_mutations,
            0,
        );
        orchestrator
            .run(seeds, budget.max_rounds, budget.max_evaluations)
            .await?;
        Ok(outcome_of(
            orchestrator.archive(),
            orchestrator.evolution_snapshot(),
        ))
    }

    async fn optimize_islands(
        &self,
        seeds: Vec<Candidate>,
        budget: RunBudget,
        temperature_mutations: bool,
    ) -> Result<OptimizationOutcome, String> {
        let n_islands = self.config.n_islands;
        let mut tuned = (*self.config).clone();
        tuned.migration_period = tuned.tuned_migration_period();
        tuned.migration_k = tuned.migration_k.clamp(1, n_islands);
        let tuned = Arc::new(tuned);

        let mut handles = Vec::with_capacity(n_islands);
        for context in islands::ring_contexts(n_islands) {
            let island_id = context.island_id;
            let mut orchestrator = self.build_orchestrator(
                tuned.clone(),
                Some(context),
                budget.enable_auto_stop,
                temperature_mutations,
                island_id as u64,
            );
            let island_seeds: Vec<Candidate> = seeds
                .iter()
                .cloned()
                .map(|seed| seed.with_island(island_id))
                .collect();
            handles.push(self.executor.native_spawn(async move {
                let run = orchestrator
                    .run(island_seeds, budget.max_rounds, budget.max_evaluations)
                    .await;
                (run, orchestrator)
            }));
        }

        let mut orchestrators = Vec::with_capacity(n_islands);
        for handle in handles {
            let (run, orchestrator) = handle
                .await
                .map_err(|e| format!("island task failed: {e}"))?;
            run?;
            orchestrators.push(orchestrator);
        }

        // All islands ran to their own stop condition; merge their frontiers.
        let mut combined = self.new_archive();
        let inserts = orchestrators
            .iter()
            .flat_map(|orchestrator| orchestrator.archive().pareto_entries())
            .map(|entry| (entry.candidate, entry.result))
            .collect();
        combined.batch_insert(inserts);

        let stats = EvolutionStats::combined(
            orchestrators
                .iter()
                .map(Orchestrator::evolution_snapshot)
                .collect(),
        );
        Ok(outcome_of(&combined, stats))
    }

    ///
    /// Two-phase staged optimization: phase 1 spends 70% of the budget on prompt text
    /// with temperature stripped everywhere, then phase 2 seeds from the best phase-1
    /// entries at temperature 0.5 with temperature mutations enabled.
    ///
    async fn optimize_staged(
        &self,
        seeds: Vec<Candidate>,
        budget: RunBudget,
    ) -> Result<OptimizationOutcome, String> {
        let multi_island = self.config.n_islands > 1;
        let phase1_budget = RunBudget {
            max_rounds: budget.max_rounds.or(Some(PHASE1_DEFAULT_ROUNDS)),
            max_evaluations: budget
                .max_evaluations
                .map(|cap| (cap as f64 * PHASE1_BUDGET_FRACTION) as usize),
            enable_auto_stop: budget.enable_auto_stop,
            staged_temperature: false,
        };
        let phase1_seeds = self.normalize_seeds(seeds, Source::SeedPhase1, true);
        let phase1 = if multi_island {
            self.optimize_islands(phase1_seeds, phase1_budget, false).await?
        } else {
            self.optimize_single(phase1_seeds, phase1_budget, false).await?
        };

        // Temperature support may have been revoked mid-phase-1 by the model itself.
        if !self.model_context.temperature_supported() || phase1.pareto_entries.is_empty() {
            let mut outcome = phase1;
            outcome.phase1_pareto = Some(outcome.pareto.clone());
            outcome.phase1_evolution_stats = Some(outcome.evolution_stats.clone());
            return Ok(outcome);
        }

        let mut top_entries = phase1.pareto_entries.clone();
        top_entries.sort_by(|a, b| {
            b.result
                .objective(&self.config.promote_objective)
                .unwrap_or(0.0)
                .total_cmp(&a.result.objective(&self.config.promote_objective).unwrap_or(0.0))
        });
        let phase2_seeds: Vec<Candidate> = top_entries
            .into_iter()
            .take(PHASE2_SEED_COUNT)
            .map(|entry| {
                let mut meta = entry.candidate.meta.clone();
                meta.temperature = Some(PHASE2_SEED_TEMPERATURE);
                meta.source = Some(Source::Phase2Seed);
                Candidate::with_meta(entry.candidate.text.clone(), meta)
            })
            .collect();

        let phase2_round_cap = if multi_island {
            PHASE2_ROUNDS_MULTI_ISLAND
        } else {
            PHASE2_ROUNDS
        };
        let phase2_budget = RunBudget {
            max_rounds: Some(
                budget
                    .max_rounds
                    .map_or(phase2_round_cap, |cap| cap.min(phase2_round_cap)),
            ),
            max_evaluations: budget
                .max_evaluations
                .map(|cap| (cap as f64 * (1.0 - PHASE1_BUDGET_FRACTION)) as usize),
            // The temperature phase runs for a fixed, short duration.
            enable_auto_stop: false,
            staged_temperature: false,
        };
        let phase2 = if multi_island {
            self.optimize_islands(phase2_seeds, phase2_budget, true).await?
        } else {
            self.optimize_single(phase2_seeds, phase2_budget, true).await?
        };

        let combined_stats = EvolutionStats::combined(vec![
            phase1.evolution_stats.clone(),
            phase2.evolution_stats.clone(),
        ]);
        Ok(OptimizationOutcome {
            pareto: phase2.pareto,
            pareto_entries: phase2.pareto_entries,
            qd_elites: phase2.qd_elites,
            evolution_stats: combined_stats,
            total_candidates: phase2.total_candidates,
            phase1_pareto: Some(phase1.pareto),
            phase1_evolution_stats: Some(phase1.evolution_stats),
            phase2_evolution_stats: Some(phase2.evolution_stats),
        })
    }

    fn build_orchestrator(
        &self,
        config: Arc<Config>,
        island: Option<IslandContext>,
        enable_auto_stop: bool,
        temperature_mutations: bool,
        sampler_seed_offset: u64,
    ) -> Orchestrator {
        let sampler = InstanceSampler::new(
            self.example_ids.clone(),
            self.sampler_seed + sampler_seed_offset,
        );
        let mutation_config = MutationConfig {
            max_mutations: config.max_mutations_per_round,
            temperature: self.reflection_temperature,
            ..MutationConfig::default()
        };
        let mutator = Arc::new(Mutator::new(
            mutation_config,
            self.reflection_model.clone(),
            self.model_context.clone(),
        ));
        mutator.set_temperature_mutations_enabled(temperature_mutations);
        let evaluator = Evaluator::new(self.cache.clone(), self.task_runner.clone())
            .with_timeout(config.eval_timeout)
            .with_min_improve(config.eps_improve);
        let governor = enable_auto_stop.then(|| StopGovernor::new(StopGovernorConfig::default()));
        Orchestrator::new(
            config,
            evaluator,
            self.new_archive(),
            sampler,
            mutator,
            self.cache.clone(),
            governor,
            island,
            self.shutdown.clone(),
        )
    }

    fn new_archive(&self) -> Archive {
        Archive::new(
            self.config.qd_bins_length.clone(),
            self.config.qd_bins_bullets.clone(),
            self.config.qd_flags.clone(),
        )
    }

    fn normalize_seeds(
        &self,
        seeds: Vec<Candidate>,
        source: Source,
        strip_temperature: bool,
    ) -> Vec<Candidate> {
        let temperature_supported = self.model_context.temperature_supported();
        seeds
            .into_iter()
            .map(|mut seed| {
                if strip_temperature || !temperature_supported {
                    seed.meta.temperature = None;
                }
                seed.with_source(source)
            })
            .collect()
    }
}

fn outcome_of(archive: &Archive, stats: EvolutionStats) -> OptimizationOutcome {
    let pareto_entries = archive.pareto_entries();
    let pareto = archive.pareto_candidates();
    let qd_elites = archive.sample_qd(pareto_entries.len().max(1));
    let total_candidates = pareto.len() + archive.qd_filled_cells();
    OptimizationOutcome {
        pareto,
        pareto_entries,
        qd_elites,
        evolution_stats: stats,
        total_candidates,
        phase1_pareto: None,
        phase1_evolution_stats: None,
        phase2_evolution_stats: None,
    }
}

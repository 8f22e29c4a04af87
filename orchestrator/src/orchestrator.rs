// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use archive::Archive;
use cache::{PersistedState, ResultCache};
use candidates::{Candidate, CandidateMeta, EvalResult, Source, NEG_COST, QUALITY, TOKENS};
use evaluator::Evaluator;
use hashing::Fingerprint;
use mutator::{Mutator, ParentContext};
use sampler::InstanceSampler;
use stop_governor::{compute_hypervolume_2d, EpochMetrics, StopGovernor};

use crate::config::Config;
use crate::evolution::{EvolutionStats, Lineage};

/// How many traces of each parent are shown to the reflection model.
const PARENT_TRACES_FOR_REFLECTION: usize = 3;
/// Upper bound on waiting for an outstanding reflection batch; the mutation task itself
/// enforces the model timeout, so this only guards against a lost task.
const MUTATION_WAIT_CAP: Duration = Duration::from_secs(240);

///
/// Cooperative run-level cancellation. Triggering does not interrupt in-flight model
/// calls; the orchestrator finishes its round, checkpoints, and returns.
///
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

///
/// One island's connection to the migration ring: candidates arrive from the
/// predecessor island on `inbox` and elites leave toward the successor on `outbox`.
///
pub struct IslandContext {
    pub island_id: usize,
    pub n_islands: usize,
    pub outbox: mpsc::UnboundedSender<Candidate>,
    pub inbox: mpsc::UnboundedReceiver<Candidate>,
}

/// Rung-indexed FIFO of pending candidates, drained highest rung first so candidates
/// close to the terminal shard finish before fresh rung-0 work begins.
#[derive(Default)]
struct CandidateQueue {
    by_rung: BTreeMap<usize, VecDeque<Candidate>>,
    len: usize,
}

impl CandidateQueue {
    fn push(&mut self, rung: usize, candidate: Candidate) {
        self.by_rung.entry(rung).or_default().push_back(candidate);
        self.len += 1;
    }

    fn pop_highest(&mut self) -> Option<(usize, Candidate)> {
        let rung = *self.by_rung.keys().next_back()?;
        let bucket = self.by_rung.get_mut(&rung)?;
        let candidate = bucket.pop_front()?;
        if bucket.is_empty() {
            self.by_rung.remove(&rung);
        }
        self.len -= 1;
        Some((rung, candidate))
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn snapshot(&self) -> Vec<Candidate> {
        self.by_rung.values().flatten().cloned().collect()
    }
}

///
/// The round loop: evaluate a batch on the current rung's shard, archive the results,
/// promote winners to the next rung, keep a pipeline of reflection calls producing new
/// rung-0 children, and checkpoint, until the budget, a target, or the convergence
/// governor ends the run.
///
pub struct Orchestrator {
    config: Arc<Config>,
    evaluator: Evaluator,
    archive: Archive,
    sampler: InstanceSampler,
    mutator: Arc<Mutator>,
    cache: ResultCache,
    governor: Option<StopGovernor>,
    island: Option<IslandContext>,
    shutdown: Shutdown,
    /// Island runs share one cache directory, so only standalone runs persist state.
    persist_state: bool,

    queue: CandidateQueue,
    known: HashSet<Fingerprint>,
    rung_of: HashMap<Fingerprint, usize>,
    cohorts: Vec<Vec<f64>>,
    lineage: Lineage,

    children_tx: mpsc::UnboundedSender<Vec<Candidate>>,
    children_rx: mpsc::UnboundedReceiver<Vec<Candidate>>,
    outstanding_mutation_batches: usize,
    mutations_enqueued: usize,

    round: usize,
    evaluations: usize,
    total_tokens: u64,
    evaluations_at_round_start: usize,
    candidates_this_round: usize,
    novel_this_round: usize,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        evaluator: Evaluator,
        archive: Archive,
        sampler: InstanceSampler,
        mutator: Arc<Mutator>,
        cache: ResultCache,
        governor: Option<StopGovernor>,
        island: Option<IslandContext>,
        shutdown: Shutdown,
    ) -> Orchestrator {
        let persist_state = island.is_none();
        let rungs = config.shards.len();
        let (children_tx, children_rx) = mpsc::unbounded_channel();
        Orchestrator {
            config,
            evaluator,
            archive,
            sampler,
            mutator,
            cache,
            governor,
            island,
            shutdown,
            persist_state,
            queue: CandidateQueue::default(),
            known: HashSet::new(),
            rung_of: HashMap::new(),
            cohorts: vec![Vec::new(); rungs],
            lineage: Lineage::default(),
            children_tx,
            children_rx,
            outstanding_mutation_batches: 0,
            mutations_enqueued: 0,
            round: 0,
            evaluations: 0,
            total_tokens: 0,
            evaluations_at_round_start: 0,
            candidates_this_round: 0,
            novel_this_round: 0,
        }
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    pub fn evolution_snapshot(&self) -> EvolutionStats {
        let mutation_stats = self.mutator.stats();
        EvolutionStats {
            mutations_requested: mutation_stats.requested,
            mutations_generated: mutation_stats.generated,
            mutations_enqueued: self.mutations_enqueued,
            mutations_promoted: self.lineage.promoted_count(),
            unique_parents: self.lineage.unique_parents(),
            unique_children: self.lineage.unique_children(),
            evolution_edges: self.lineage.edge_count(),
            total_evaluations: self.evaluations,
            islands: Vec::new(),
        }
    }

    ///
    /// Run rounds until a budget, the target quality, queue exhaustion, a shutdown
    /// trigger, or (when a governor is installed) convergence.
    ///
    pub async fn run(
        &mut self,
        seeds: Vec<Candidate>,
        max_rounds: Option<usize>,
        max_evaluations: Option<usize>,
    ) -> Result<(), String> {
        self.config.validate()?;

        let resumed = self.try_resume().await;
        if !resumed {
            for seed in seeds {
                self.admit(seed, 0);
            }
        }
        if self.queue.is_empty() {
            return Err("no candidates to optimize: provide at least one seed".to_owned());
        }

        loop {
            if self.shutdown.triggered() {
                log::info!("Shutdown requested; checkpointing and stopping");
                self.checkpoint().await;
                return Ok(());
            }
            if max_rounds.is_some_and(|cap| self.round >= cap) {
                log::info!("Round budget exhausted after {} rounds", self.round);
                break;
            }
            if max_evaluations.is_some_and(|cap| self.evaluations >= cap) {
                log::info!("Evaluation budget exhausted at {}", self.evaluations);
                break;
            }

            self.drain_migrants();
            self.drain_children();

            let batch = self.pop_batch();
            if batch.is_empty() {
                if self.outstanding_mutation_batches > 0 {
                    // Nothing to evaluate until a reflection call lands.
                    match tokio::time::timeout(MUTATION_WAIT_CAP, self.children_rx.recv()).await {
                        Ok(Some(children)) => {
                            self.outstanding_mutation_batches -= 1;
                            self.admit_children(children);
                            continue;
                        }
                        Ok(None) | Err(_) => {
                            log::warn!("Mutation pipeline stalled; ending run");
                            break;
                        }
                    }
                }
                log::info!("Queue exhausted after {} rounds", self.round);
                break;
            }

            let target_reached = self.run_round(batch).await;

            self.maybe_spawn_mutation();

            let converged = self.update_governor();

            self.maybe_migrate();
            self.checkpoint().await;
            self.round += 1;

            if target_reached {
                log::info!("Target quality reached on the terminal shard");
                break;
            }
            if converged {
                break;
            }
        }

        // A finished run must not be resumed into by a later, unrelated run.
        if self.persist_state {
            self.cache.clear_state();
        }
        Ok(())
    }

    ///
    /// Evaluate one batch concurrently, archive results, and promote. Returns whether
    /// the target quality was reached on the terminal shard.
    ///
    async fn run_round(&mut self, batch: Vec<(usize, Candidate)>) -> bool {
        self.evaluations_at_round_start = self.evaluations;
        self.candidates_this_round = 0;
        self.novel_this_round = 0;
        // Split the overall concurrency budget across the candidates evaluated together.
        let per_candidate_concurrency =
            (self.config.eval_concurrency / batch.len().max(1)).max(1);

        let evaluations = batch.into_iter().map(|(rung, candidate)| {
            let shard_fraction = self.config.shards[rung];
            let example_ids = self.sampler.sample(shard_fraction);
            let evaluator = &self.evaluator;
            async move {
                let outcome = evaluator
                    .eval_on_shard(
                        &candidate,
                        &example_ids,
                        per_candidate_concurrency,
                        Some(shard_fraction),
                    )
                    .await;
                (rung, candidate, outcome)
            }
        });
        let outcomes = futures::future::join_all(evaluations).await;

        let mut evaluated: Vec<(usize, Candidate, EvalResult)> = Vec::new();
        for (rung, candidate, outcome) in outcomes {
            match outcome {
                Ok(result) => evaluated.push((rung, candidate, result)),
                Err(e) => {
                    log::error!("Discarding invalid candidate: {e}");
                }
            }
        }

        // Ingest before promotion so every cohort includes this round's scores.
        for (rung, candidate, result) in &evaluated {
            self.ingest(*rung, candidate, result);
        }

        let mut target_reached = false;
        let terminal_rung = self.config.shards.len() - 1;
        for (rung, candidate, result) in evaluated {
            if rung < terminal_rung {
                self.consider_promotion(rung, candidate, &result);
            } else if let Some(target) = self.config.target_quality {
                if result.quality() >= target {
                    target_reached = true;
                }
            }
        }
        target_reached
    }

    fn ingest(&mut self, rung: usize, candidate: &Candidate, result: &EvalResult) {
        let fingerprint = candidate.fingerprint();
        self.evaluations += result.n_examples;
        let tokens = result.objective(TOKENS).unwrap_or(0.0) * result.n_examples as f64;
        self.total_tokens += tokens.max(0.0) as u64;

        let rung_entry = self.rung_of.entry(fingerprint).or_insert(rung);
        *rung_entry = (*rung_entry).max(rung);

        let score = result.objective(&self.config.promote_objective).unwrap_or(0.0);
        self.cohorts[rung].push(score);

        if let (Some(parent), Some(parent_quality)) = (
            candidate.meta.parent_fingerprint,
            candidate.meta.parent_quality(),
        ) {
            self.lineage.record_child_outcome(
                parent,
                result.quality(),
                parent_quality,
                self.config.lineage_min_improve,
            );
        }

        let outcome = self.archive.insert(candidate.clone(), result.clone());
        self.candidates_this_round += 1;
        if outcome.claimed_empty_cell {
            self.novel_this_round += 1;
        }
    }

    ///
    /// ASHA promotion: advance past the cohort quantile (plus margin), or, with rung
    /// convergence enabled, when the candidate's own lineage has stalled for long
    /// enough that keeping it at this rung would starve the search.
    ///
    fn consider_promotion(&mut self, rung: usize, candidate: Candidate, result: &EvalResult) {
        let fingerprint = candidate.fingerprint();
        let score = result.objective(&self.config.promote_objective).unwrap_or(0.0);
        let threshold = quantile(&self.cohorts[rung], self.config.cohort_quantile);
        let clears_cohort = score >= threshold + self.config.eps_improve;
        let stalled_lineage = self.config.enable_rung_convergence
            && self.lineage.stalled(&fingerprint, self.config.lineage_patience);

        if !clears_cohort && !stalled_lineage {
            return;
        }
        let next_rung = rung + 1;
        log::debug!(
            "Promoting {fingerprint} to rung {next_rung} (score {score:.3}, threshold {threshold:.3})"
        );
        if candidate.meta.source == Some(Source::Mutation) {
            self.lineage.record_promotion(fingerprint);
        }
        self.rung_of.insert(fingerprint, next_rung);
        self.queue.push(next_rung, candidate);
    }

    /// Admit a candidate at a rung, deduplicating on fingerprint.
    fn admit(&mut self, candidate: Candidate, rung: usize) -> bool {
        let fingerprint = candidate.fingerprint();
        if !self.known.insert(fingerprint) {
            return false;
        }
        self.rung_of.entry(fingerprint).or_insert(rung);
        self.queue.push(rung, candidate);
        true
    }

    fn admit_children(&mut self, children: Vec<Candidate>) {
        for child in children {
            if self.queue.len() >= self.config.queue_limit {
                log::debug!("Queue at capacity; dropping surplus child");
                continue;
            }
            let parent = child.meta.parent_fingerprint;
            let child_fingerprint = child.fingerprint();
            if self.admit(child, 0) {
                self.mutations_enqueued += 1;
                if let Some(parent) = parent {
                    self.lineage.record_edge(parent, child_fingerprint);
                }
            }
        }
    }

    fn pop_batch(&mut self) -> Vec<(usize, Candidate)> {
        let mut batch = Vec::new();
        while batch.len() < self.config.batch_size {
            match self.queue.pop_highest() {
                Some((rung, candidate)) => batch.push((rung, candidate)),
                None => break,
            }
        }
        batch
    }

    fn drain_children(&mut self) {
        while let Ok(children) = self.children_rx.try_recv() {
            self.outstanding_mutation_batches -= 1;
            self.admit_children(children);
        }
    }

    fn drain_migrants(&mut self) {
        let mut migrants = Vec::new();
        if let Some(island) = &mut self.island {
            while let Ok(migrant) = island.inbox.try_recv() {
                log::debug!(
                    "Island {} received migrant {}",
                    island.island_id,
                    migrant.fingerprint()
                );
                migrants.push(migrant);
            }
        }
        for migrant in migrants {
            self.admit(migrant, 0);
        }
    }

    ///
    /// Keep the reflection pipeline full: when few enough children are in flight and the
    /// queue has room, launch one batched reflection call against the best parents.
    /// The call runs concurrently with subsequent evaluation rounds.
    ///
    fn maybe_spawn_mutation(&mut self) {
        let in_flight_children =
            self.outstanding_mutation_batches * self.config.max_mutations_per_round;
        if in_flight_children >= self.config.mutation_buffer_min.max(1) {
            return;
        }
        if self.queue.len() >= self.config.queue_limit {
            return;
        }

        let mut entries = self.archive.pareto_entries();
        if entries.is_empty() {
            return;
        }
        // Prefer parents that have survived to the highest rung, then the best scores.
        entries.sort_by(|a, b| {
            let rung_a = self.rung_of.get(&a.candidate.fingerprint()).copied().unwrap_or(0);
            let rung_b = self.rung_of.get(&b.candidate.fingerprint()).copied().unwrap_or(0);
            rung_b
                .cmp(&rung_a)
                .then(b.result.quality().total_cmp(&a.result.quality()))
        });
        entries.truncate(mutator::MAX_PARENTS_PER_REFLECTION);

        let parents: Vec<ParentContext> = entries
            .iter()
            .map(|entry| ParentContext {
                prompt: entry.candidate.text.clone(),
                quality: entry.result.quality(),
                shard_fraction: entry.result.shard_fraction,
                temperature: entry.candidate.meta.temperature,
                traces: entry
                    .result
                    .traces
                    .iter()
                    .take(PARENT_TRACES_FOR_REFLECTION)
                    .cloned()
                    .collect(),
            })
            .collect();

        let primary = &entries[0];
        let primary_fingerprint = primary.candidate.fingerprint();
        let primary_objectives = primary.result.objectives.clone();
        let primary_temperature = primary.candidate.meta.temperature;
        let island = self.island.as_ref().map(|context| context.island_id);
        let num_mutations = self.config.max_mutations_per_round;
        let mutator = self.mutator.clone();
        let tx = self.children_tx.clone();

        self.outstanding_mutation_batches += 1;
        tokio::spawn(async move {
            let children = match mutator.reflect(&parents, num_mutations).await {
                Ok(texts) => texts
                    .into_iter()
                    .enumerate()
                    .map(|(index, text)| {
                        let meta = CandidateMeta {
                            temperature: mutator.child_temperature(primary_temperature, index),
                            source: Some(Source::Mutation),
                            parent_fingerprint: Some(primary_fingerprint),
                            parent_objectives: Some(primary_objectives.clone()),
                            island,
                            extra: BTreeMap::new(),
                        };
                        Candidate::with_meta(text, meta)
                    })
                    .collect(),
                Err(e) => {
                    // One failed reflection batch never aborts the run.
                    log::error!("Reflection call failed; continuing with existing queue: {e}");
                    Vec::new()
                }
            };
            // The orchestrator counts this batch as outstanding until it receives the
            // message, so every spawned task must send exactly once.
            let _ = tx.send(children);
        });
    }

    /// Returns true when the governor says the run has converged.
    fn update_governor(&mut self) -> bool {
        let points = self.archive.objective_points(QUALITY, NEG_COST);
        let hypervolume = compute_hypervolume_2d(&points, (0.0, 0.0));
        let best_quality = self
            .archive
            .best_by(QUALITY)
            .and_then(|entry| entry.result.objective(QUALITY))
            .unwrap_or(0.0);
        let best_cost = self
            .archive
            .best_by(NEG_COST)
            .and_then(|entry| entry.result.objective(NEG_COST))
            .unwrap_or(0.0);
        let frontier_ids = self
            .archive
            .pareto_fingerprints()
            .into_iter()
            .map(|fingerprint| fingerprint.to_hex())
            .collect();
        let epoch = EpochMetrics {
            round_num: self.round,
            hypervolume,
            new_evaluations: self.epoch_evaluations(),
            best_quality,
            best_cost,
            frontier_ids,
            qd_filled_cells: self.archive.qd_filled_cells(),
            qd_total_cells: self.archive.qd_total_cells(),
            qd_novelty_rate: self.epoch_novelty_rate(),
            total_tokens_spent: self.total_tokens,
        };
        match &mut self.governor {
            Some(governor) => {
                governor.update(epoch);
                governor.should_stop()
            }
            None => false,
        }
    }

    fn epoch_evaluations(&self) -> usize {
        self.evaluations.saturating_sub(self.evaluations_at_round_start)
    }

    fn epoch_novelty_rate(&self) -> f64 {
        if self.candidates_this_round == 0 {
            0.0
        } else {
            self.novel_this_round as f64 / self.candidates_this_round as f64
        }
    }

    fn maybe_migrate(&mut self) {
        let Some(island) = &self.island else {
            return;
        };
        if island.n_islands < 2 {
            return;
        }
        let period = self.config.migration_period.max(1);
        if self.round == 0 || self.round % period != 0 {
            return;
        }
        let mut entries = self.archive.pareto_entries();
        entries.sort_by(|a, b| {
            b.result
                .objective(&self.config.promote_objective)
                .unwrap_or(0.0)
                .total_cmp(&a.result.objective(&self.config.promote_objective).unwrap_or(0.0))
        });
        let recipient = (island.island_id + 1) % island.n_islands;
        for entry in entries.into_iter().take(self.config.migration_k) {
            let mut meta = entry.candidate.meta.clone();
            meta.source = Some(Source::Migration);
            meta.island = Some(recipient);
            let migrant = Candidate::with_meta(entry.candidate.text.clone(), meta);
            if island.outbox.send(migrant).is_err() {
                // The neighbor already finished its run; migration is best-effort.
                log::debug!("Island {} finished; skipping migration", recipient);
                break;
            }
        }
    }

    async fn try_resume(&mut self) -> bool {
        if !self.persist_state {
            return false;
        }
        let Some(state) = self.cache.load_state().await else {
            return false;
        };
        log::info!(
            "Resuming from checkpoint: round {}, {} evaluations",
            state.round,
            state.evaluations
        );
        self.round = state.round;
        self.evaluations = state.evaluations;
        // Rungs are not persisted: everything re-enters at rung 0 and climbs back via
        // the cache, which makes re-evaluation nearly free.
        for candidate in state
            .queue
            .into_iter()
            .chain(state.pareto)
            .chain(state.qd)
        {
            self.admit(candidate, 0);
        }
        true
    }

    async fn checkpoint(&mut self) {
        if !self.persist_state {
            return;
        }
        let state = PersistedState {
            round: self.round,
            evaluations: self.evaluations,
            pareto: self.archive.pareto_candidates(),
            qd: self.archive.sample_qd(self.archive.qd_filled_cells()),
            queue: self.queue.snapshot(),
        };
        self.cache.save_state(&state).await;
    }
}

/// Nearest-rank quantile over an unsorted cohort.
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() - 1) as f64 * q).ceil() as usize;
    sorted[index.min(sorted.len() - 1)]
}

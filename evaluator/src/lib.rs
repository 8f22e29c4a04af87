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
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use cache::ResultCache;
use candidates::{Candidate, EvalResult, Trace, NEG_COST, QUALITY, TOKENS};
use hashing::Fingerprint;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_EARLY_STOP_FRACTION: f64 = 0.9;
/// How many measured (non-cached) durations are needed before straggler math is trusted.
const MIN_DURATION_SAMPLES: usize = 5;
const PROGRESS_TICK: Duration = Duration::from_secs(5);

///
/// Raw metrics returned by a task runner for one example. `quality` must be in [0, 1];
/// the remaining fields enrich the trace shown to the reflection model.
///
#[derive(Clone, Debug, Default)]
pub struct TaskMetrics {
    pub quality: f64,
    pub tokens: f64,
    pub input: Option<String>,
    pub expected_answer: Option<String>,
    pub output: Option<String>,
    pub additional_context: Option<BTreeMap<String, String>>,
}

///
/// The external contract for executing one candidate against one example, typically by
/// calling the task LLM. Failures surface as error strings; the evaluator degrades them
/// to zero-quality results rather than propagating.
///
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, candidate: &Candidate, example_id: &str) -> Result<TaskMetrics, String>;
}

pub type Validator = Box<dyn Fn(&Candidate) -> Result<(), String> + Send + Sync>;
pub type MetricsMapper = Box<dyn Fn(&TaskMetrics) -> BTreeMap<String, f64> + Send + Sync>;

fn default_metrics_mapper(metrics: &TaskMetrics) -> BTreeMap<String, f64> {
    let mut objectives = BTreeMap::new();
    objectives.insert(QUALITY.to_owned(), metrics.quality);
    objectives.insert(NEG_COST.to_owned(), -metrics.tokens);
    objectives.insert(TOKENS.to_owned(), metrics.tokens);
    objectives
}

struct Progress {
    results: Vec<EvalResult>,
    completed: usize,
    running_quality: f64,
    eval_durations: Vec<f64>,
    parent_target_unreachable: bool,
}

/// Everything one shard evaluation's per-example tasks share.
struct ShardRun {
    cache: ResultCache,
    task_runner: Arc<dyn TaskRunner>,
    metrics_mapper: Arc<MetricsMapper>,
    semaphore: Semaphore,
    progress: Mutex<Progress>,
    candidate: Candidate,
    fingerprint: Fingerprint,
    timeout: Option<Duration>,
    parent_target: Option<f64>,
    shard_fraction: Option<f64>,
    total: usize,
    inflight: Arc<AtomicUsize>,
    max_observed_inflight: Arc<AtomicUsize>,
}

impl ShardRun {
    async fn eval_one(self: Arc<Self>, example_id: String) {
        if let Some(cached) = self.cache.get(&self.fingerprint, &example_id).await {
            let quality = cached.quality();
            self.register_result(cached, quality, None);
            return;
        }

        let task_start = Instant::now();
        let outcome = {
            let Ok(_permit) = self.semaphore.acquire().await else {
                return;
            };
            let current = self.inflight.fetch_add(1, Ordering::Relaxed) + 1;
            self.max_observed_inflight.fetch_max(current, Ordering::Relaxed);
            let run = self.task_runner.run(&self.candidate, &example_id);
            let outcome = match self.timeout {
                Some(timeout) => match tokio::time::timeout(timeout, run).await {
                    Ok(result) => result,
                    Err(_) => Err("timeout".to_owned()),
                },
                None => run.await,
            };
            self.inflight.fetch_sub(1, Ordering::Relaxed);
            outcome
        };

        match outcome {
            Ok(metrics) => {
                let objectives = (self.metrics_mapper)(&metrics);
                let mut trace = Trace::new(&example_id);
                trace.quality = Some(metrics.quality);
                trace.tokens = Some(metrics.tokens);
                trace.input = metrics.input.clone();
                trace.expected_answer = metrics.expected_answer.clone();
                trace.additional_context = metrics.additional_context.clone();
                if let Some(output) = &metrics.output {
                    trace = trace.with_output(output.clone());
                }
                let result = EvalResult {
                    objectives,
                    traces: vec![trace],
                    n_examples: 1,
                    shard_fraction: self.shard_fraction,
                    example_ids: vec![example_id.clone()],
                };
                if let Err(e) = self.cache.set(&self.fingerprint, &example_id, &result).await {
                    log::error!("Failed to cache result for example {example_id}: {e}");
                }
                let duration = task_start.elapsed().as_secs_f64();
                self.register_result(result, metrics.quality, Some(duration));
            }
            Err(error) => {
                // Never cached: the next run should retry failed and timed-out examples.
                log::error!("Evaluation failed for example {example_id}: {error}");
                let objectives = (self.metrics_mapper)(&TaskMetrics::default());
                let mut trace = Trace::new(&example_id);
                trace.quality = Some(0.0);
                trace.tokens = Some(0.0);
                trace.error = Some(error);
                let result = EvalResult {
                    objectives,
                    traces: vec![trace],
                    n_examples: 1,
                    shard_fraction: self.shard_fraction,
                    example_ids: vec![example_id.clone()],
                };
                self.register_result(result, 0.0, None);
            }
        }
    }

    fn register_result(&self, result: EvalResult, quality: f64, duration: Option<f64>) {
        let mut progress = self.progress.lock();
        progress.completed += result.n_examples;
        progress.running_quality += quality * result.n_examples.max(1) as f64;
        if let Some(duration) = duration {
            progress.eval_durations.push(duration);
        }
        progress.results.push(result);
        if let Some(target) = self.parent_target {
            if self.total > 0 && !progress.parent_target_unreachable {
                let remaining = self.total.saturating_sub(progress.completed);
                let best_possible =
                    (progress.running_quality + remaining as f64) / self.total as f64;
                if best_possible + 1e-9 < target {
                    progress.parent_target_unreachable = true;
                }
            }
        }
    }
}

///
/// Evaluates one candidate over a shard of example ids with a concurrency cap,
/// consulting the cache before the task runner, and producing one averaged EvalResult.
///
/// Two early exits bound wall-clock time: the parent-target cutoff abandons a candidate
/// as soon as even perfect remaining scores cannot beat its parent, and the straggler
/// pass abandons the last few examples once the batch has waited well past the average
/// evaluation duration.
///
pub struct Evaluator {
    cache: ResultCache,
    task_runner: Arc<dyn TaskRunner>,
    validators: Vec<Validator>,
    metrics_mapper: Arc<MetricsMapper>,
    timeout: Option<Duration>,
    min_improve: f64,
    early_stop_fraction: f64,
    inflight: Arc<AtomicUsize>,
    max_observed_inflight: Arc<AtomicUsize>,
}

impl Evaluator {
    pub fn new(cache: ResultCache, task_runner: Arc<dyn TaskRunner>) -> Evaluator {
        Evaluator {
            cache,
            task_runner,
            validators: Vec::new(),
            metrics_mapper: Arc::new(Box::new(default_metrics_mapper)),
            timeout: Some(DEFAULT_TASK_TIMEOUT),
            min_improve: 0.0,
            early_stop_fraction: DEFAULT_EARLY_STOP_FRACTION,
            inflight: Arc::new(AtomicUsize::new(0)),
            max_observed_inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_validators(mut self, validators: Vec<Validator>) -> Evaluator {
        self.validators = validators;
        self
    }

    pub fn with_metrics_mapper(mut self, mapper: MetricsMapper) -> Evaluator {
        self.metrics_mapper = Arc::new(mapper);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Evaluator {
        self.timeout = timeout;
        self
    }

    pub fn with_min_improve(mut self, min_improve: f64) -> Evaluator {
        self.min_improve = min_improve;
        self
    }

    pub fn with_early_stop_fraction(mut self, fraction: f64) -> Evaluator {
        self.early_stop_fraction = fraction;
        self
    }

    /// Current number of example-level evaluations running.
    pub fn inflight_examples(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Highest concurrent example-level evaluations seen since construction.
    pub fn max_observed_inflight(&self) -> usize {
        self.max_observed_inflight.load(Ordering::Relaxed)
    }

    ///
    /// Evaluate `candidate` on `example_ids` with at most `concurrency` task-runner
    /// calls in flight. Cached results are reused; only misses trigger model calls.
    ///
    /// Fails only when a validator rejects the candidate: every per-example failure
    /// degrades to a zero-quality trace instead.
    ///
    pub async fn eval_on_shard(
        &self,
        candidate: &Candidate,
        example_ids: &[String],
        concurrency: usize,
        shard_fraction: Option<f64>,
    ) -> Result<EvalResult, String> {
        for validator in &self.validators {
            validator(candidate)?;
        }

        let parent_target = candidate
            .meta
            .parent_quality()
            .map(|score| (score + self.min_improve).clamp(0.0, 1.0));

        let total = example_ids.len();
        let concurrency = concurrency.max(1);
        let run = Arc::new(ShardRun {
            cache: self.cache.clone(),
            task_runner: self.task_runner.clone(),
            metrics_mapper: self.metrics_mapper.clone(),
            semaphore: Semaphore::new(concurrency),
            progress: Mutex::new(Progress {
                results: Vec::with_capacity(total),
                completed: 0,
                running_quality: 0.0,
                eval_durations: Vec::new(),
                parent_target_unreachable: false,
            }),
            candidate: candidate.clone(),
            fingerprint: candidate.fingerprint(),
            timeout: self.timeout,
            parent_target,
            shard_fraction,
            total,
            inflight: self.inflight.clone(),
            max_observed_inflight: self.max_observed_inflight.clone(),
        });

        let mut tasks = JoinSet::new();
        for example_id in example_ids {
            tasks.spawn(run.clone().eval_one(example_id.clone()));
        }

        let batch_start = Instant::now();
        let early_stop_target = (total as f64 * self.early_stop_fraction) as usize;

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        None => break,
                        // Panics in spawned tasks should propagate; cancellations are expected.
                        Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Some(_) => {}
                    }
                }
                _ = tokio::time::sleep(PROGRESS_TICK) => {
                    let completed = run.progress.lock().completed;
                    log::debug!("Waiting for evaluations: {completed}/{total} completed");
                    continue;
                }
            }

            let (unreachable, cancel_stragglers) = {
                let progress = run.progress.lock();
                (
                    progress.parent_target_unreachable,
                    self.stragglers_exceeded(
                        &progress,
                        early_stop_target,
                        tasks.len(),
                        concurrency,
                        batch_start,
                    ),
                )
            };
            if unreachable {
                log::debug!(
                    "Early stop: candidate {} cannot beat parent target",
                    run.fingerprint,
                );
                tasks.abort_all();
                break;
            }
            if cancel_stragglers {
                log::debug!(
                    "Early stop: cancelling {} straggler evaluations for {}",
                    tasks.len(),
                    run.fingerprint,
                );
                tasks.abort_all();
                break;
            }
        }
        // Collect aborted tasks so that nothing is left running against this shard.
        while tasks.join_next().await.is_some() {}

        let result = aggregate(&run.progress.lock().results, shard_fraction);
        Ok(result)
    }

    ///
    /// True when enough of the shard has completed that the remaining tasks are
    /// stragglers: past the early-stop fraction, with enough measured durations, and
    /// with the batch now waiting more than twice the average evaluation beyond the
    /// point it should have reached the target.
    ///
    fn stragglers_exceeded(
        &self,
        progress: &Progress,
        early_stop_target: usize,
        remaining: usize,
        concurrency: usize,
        batch_start: Instant,
    ) -> bool {
        if self.early_stop_fraction >= 1.0
            || remaining < 2
            || progress.completed < early_stop_target
            || progress.eval_durations.len() < MIN_DURATION_SAMPLES
        {
            return false;
        }
        let avg_duration =
            progress.eval_durations.iter().sum::<f64>() / progress.eval_durations.len() as f64;
        let expected_time_for_remaining = avg_duration * 2.0;
        let expected_time_to_target = (early_stop_target as f64 / concurrency as f64) * avg_duration;
        let waited_past_target = batch_start.elapsed().as_secs_f64() - expected_time_to_target;
        waited_past_target > expected_time_for_remaining
    }
}

///
/// Sum-then-average objectives weighted by example counts, concatenating traces and the
/// ids actually completed.
///
fn aggregate(results: &[EvalResult], shard_fraction: Option<f64>) -> EvalResult {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    let mut traces = Vec::new();
    let mut example_ids = Vec::new();
    let mut n_examples = 0_usize;
    for result in results {
        for (key, value) in &result.objectives {
            *totals.entry(key.clone()).or_insert(0.0) += value * result.n_examples as f64;
        }
        traces.extend(result.traces.iter().cloned());
        example_ids.extend(result.example_ids.iter().cloned());
        n_examples += result.n_examples;
    }
    let denominator = n_examples.max(1) as f64;
    for value in totals.values_mut() {
        *value /= denominator;
    }
    EvalResult {
        objectives: totals,
        traces,
        n_examples,
        shard_fraction,
        example_ids,
    }
}

#[cfg(test)]
mod tests;

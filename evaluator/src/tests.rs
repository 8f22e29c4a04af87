// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use cache::ResultCache;
use candidates::{Candidate, CandidateMeta, QUALITY};
use task_executor::Executor;

use crate::{Evaluator, TaskMetrics, TaskRunner, Validator};

/// Scores 1.0 for every example unless the example id appears in `failures`, and counts
/// every invocation.
struct StubRunner {
    calls: AtomicUsize,
    failures: Vec<String>,
    quality: f64,
    delay: Option<Duration>,
}

impl StubRunner {
    fn perfect() -> StubRunner {
        StubRunner {
            calls: AtomicUsize::new(0),
            failures: Vec::new(),
            quality: 1.0,
            delay: None,
        }
    }

    fn with_quality(quality: f64) -> StubRunner {
        StubRunner {
            quality,
            ..StubRunner::perfect()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for StubRunner {
    async fn run(&self, _candidate: &Candidate, example_id: &str) -> Result<TaskMetrics, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failures.iter().any(|id| id == example_id) {
            return Err(format!("synthetic failure for {example_id}"));
        }
        Ok(TaskMetrics {
            quality: self.quality,
            tokens: 10.0,
            input: Some(format!("input for {example_id}")),
            expected_answer: Some("42".to_owned()),
            output: Some("the answer is 42".to_owned()),
            additional_context: None,
        })
    }
}

fn example_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("e{i}")).collect()
}

fn new_cache(dir: &TempDir) -> ResultCache {
    ResultCache::new(dir.path().join("cache"), Executor::new()).unwrap()
}

#[tokio::test]
async fn evaluates_all_examples_and_averages() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::with_quality(0.5));
    let evaluator = Evaluator::new(new_cache(&dir), runner.clone());

    let candidate = Candidate::new("Answer carefully.");
    let result = evaluator
        .eval_on_shard(&candidate, &example_ids(4), 2, Some(1.0))
        .await
        .unwrap();

    assert_eq!(runner.calls(), 4);
    assert_eq!(result.n_examples, 4);
    assert!((result.quality() - 0.5).abs() < 1e-9);
    assert_eq!(result.traces.len(), 4);
    assert_eq!(result.shard_fraction, Some(1.0));
    assert_eq!(result.example_ids.len(), 4);
}

#[tokio::test]
async fn second_evaluation_is_served_entirely_from_cache() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::perfect());
    let evaluator = Evaluator::new(new_cache(&dir), runner.clone());

    let candidate = Candidate::new("Answer carefully.");
    let ids = example_ids(5);
    let first = evaluator
        .eval_on_shard(&candidate, &ids, 4, Some(1.0))
        .await
        .unwrap();
    assert_eq!(runner.calls(), 5);

    let second = evaluator
        .eval_on_shard(&candidate, &ids, 4, Some(1.0))
        .await
        .unwrap();
    assert_eq!(runner.calls(), 5, "cached results must not re-invoke the runner");
    for (key, value) in &first.objectives {
        assert!((second.objectives[key] - value).abs() < 1e-9);
    }
}

#[tokio::test]
async fn cached_results_survive_process_restart() {
    let dir = TempDir::new().unwrap();
    let candidate = Candidate::new("Answer carefully.");
    let ids = example_ids(3);
    {
        let runner = Arc::new(StubRunner::perfect());
        let evaluator = Evaluator::new(new_cache(&dir), runner.clone());
        evaluator
            .eval_on_shard(&candidate, &ids, 2, Some(0.5))
            .await
            .unwrap();
        assert_eq!(runner.calls(), 3);
    }
    // A fresh cache instance over the same directory reads the flushed records.
    let runner = Arc::new(StubRunner::perfect());
    let evaluator = Evaluator::new(new_cache(&dir), runner.clone());
    let result = evaluator
        .eval_on_shard(&candidate, &ids, 2, Some(0.5))
        .await
        .unwrap();
    assert_eq!(runner.calls(), 0);
    assert_eq!(result.n_examples, 3);
}

#[tokio::test]
async fn parent_target_cutoff_cancels_remaining_examples() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner {
        calls: AtomicUsize::new(0),
        failures: Vec::new(),
        quality: 0.0,
        delay: Some(Duration::from_millis(10)),
    });
    let evaluator = Evaluator::new(new_cache(&dir), runner.clone()).with_min_improve(0.01);

    let mut parent_objectives = BTreeMap::new();
    parent_objectives.insert(QUALITY.to_owned(), 0.9);
    let candidate = Candidate::with_meta(
        "A child that scores zero everywhere.",
        CandidateMeta {
            parent_objectives: Some(parent_objectives),
            ..CandidateMeta::default()
        },
    );

    let result = evaluator
        .eval_on_shard(&candidate, &example_ids(10), 2, Some(1.0))
        .await
        .unwrap();

    // After the first few zero-quality completions, perfect remaining scores can no
    // longer reach 0.91, so the evaluator cancels instead of running all ten.
    assert!(result.n_examples < 10, "evaluated {} examples", result.n_examples);
    assert!(
        runner.calls() <= 4,
        "expected early cancellation, saw {} calls",
        runner.calls()
    );
}

#[tokio::test]
async fn failed_examples_degrade_to_zero_quality_and_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner {
        calls: AtomicUsize::new(0),
        failures: vec!["e1".to_owned()],
        quality: 1.0,
        delay: None,
    });
    let evaluator = Evaluator::new(new_cache(&dir), runner.clone());

    let candidate = Candidate::new("Answer carefully.");
    let ids = example_ids(3);
    let result = evaluator
        .eval_on_shard(&candidate, &ids, 3, Some(1.0))
        .await
        .unwrap();

    assert_eq!(result.n_examples, 3);
    assert!((result.quality() - 2.0 / 3.0).abs() < 1e-9);
    let failed_trace = result
        .traces
        .iter()
        .find(|trace| trace.example_id == "e1")
        .unwrap();
    assert!(failed_trace.error.as_deref().unwrap().contains("synthetic failure"));

    // The failure was not cached: a second run retries e1 (and only e1).
    let before = runner.calls();
    evaluator
        .eval_on_shard(&candidate, &ids, 3, Some(1.0))
        .await
        .unwrap();
    assert_eq!(runner.calls(), before + 1);
}

#[tokio::test(start_paused = true)]
async fn timeouts_degrade_to_zero_quality_and_are_not_cached() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner {
        calls: AtomicUsize::new(0),
        failures: Vec::new(),
        quality: 1.0,
        delay: Some(Duration::from_secs(600)),
    });
    let evaluator = Evaluator::new(new_cache(&dir), runner.clone())
        .with_timeout(Some(Duration::from_millis(50)));

    let candidate = Candidate::new("Answer slowly.");
    let result = evaluator
        .eval_on_shard(&candidate, &example_ids(2), 2, Some(1.0))
        .await
        .unwrap();

    assert_eq!(result.n_examples, 2);
    assert!((result.quality() - 0.0).abs() < 1e-9);
    for trace in &result.traces {
        assert_eq!(trace.error.as_deref(), Some("timeout"));
    }

    // Nothing was cached, so a rerun calls the runner again.
    let before = runner.calls();
    evaluator
        .eval_on_shard(&candidate, &example_ids(2), 2, Some(1.0))
        .await
        .unwrap();
    assert_eq!(runner.calls(), before + 2);
}

#[tokio::test]
async fn validators_fail_fast_without_runner_calls() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner::perfect());
    let reject_short: Validator = Box::new(|candidate: &Candidate| {
        if candidate.text.len() < 10 {
            Err("instruction too short".to_owned())
        } else {
            Ok(())
        }
    });
    let evaluator =
        Evaluator::new(new_cache(&dir), runner.clone()).with_validators(vec![reject_short]);

    let err = evaluator
        .eval_on_shard(&Candidate::new("short"), &example_ids(3), 2, Some(1.0))
        .await
        .unwrap_err();
    assert!(err.contains("too short"));
    assert_eq!(runner.calls(), 0);
}

#[tokio::test]
async fn tracks_inflight_high_water_mark() {
    let dir = TempDir::new().unwrap();
    let runner = Arc::new(StubRunner {
        calls: AtomicUsize::new(0),
        failures: Vec::new(),
        quality: 1.0,
        delay: Some(Duration::from_millis(20)),
    });
    let evaluator = Evaluator::new(new_cache(&dir), runner);
    evaluator
        .eval_on_shard(&Candidate::new("Answer carefully."), &example_ids(8), 4, Some(1.0))
        .await
        .unwrap();
    assert!(evaluator.max_observed_inflight() <= 4);
    assert!(evaluator.max_observed_inflight() >= 1);
    assert_eq!(evaluator.inflight_examples(), 0);
}

// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeMap;
use std::io::Write;

use tempfile::TempDir;

use candidates::{Candidate, EvalResult, Trace, QUALITY};
use task_executor::Executor;

use crate::{PersistedState, ResultCache};

fn new_cache(dir: &TempDir) -> ResultCache {
    ResultCache::new(dir.path().join("cache"), Executor::new()).unwrap()
}

fn result_for(example_id: &str, quality: f64) -> EvalResult {
    let mut objectives = BTreeMap::new();
    objectives.insert(QUALITY.to_owned(), quality);
    EvalResult {
        objectives,
        traces: vec![Trace::new(example_id)],
        n_examples: 1,
        shard_fraction: Some(0.5),
        example_ids: vec![example_id.to_owned()],
    }
}

#[tokio::test]
async fn get_then_set_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let fingerprint = Candidate::new("Answer carefully.").fingerprint();

    assert_eq!(cache.get(&fingerprint, "e1").await, None);
    let result = result_for("e1", 1.0);
    cache.set(&fingerprint, "e1", &result).await.unwrap();
    let fetched = cache.get(&fingerprint, "e1").await.unwrap();
    assert_eq!(fetched.objectives, result.objectives);
    assert_eq!(fetched.example_ids, vec!["e1".to_owned()]);
    assert_eq!(cache.get(&fingerprint, "e2").await, None);
}

#[tokio::test]
async fn records_survive_a_fresh_cache_instance() {
    let dir = TempDir::new().unwrap();
    let fingerprint = Candidate::new("Answer carefully.").fingerprint();
    {
        let cache = new_cache(&dir);
        cache
            .set(&fingerprint, "e1", &result_for("e1", 0.25))
            .await
            .unwrap();
    }
    let cache = new_cache(&dir);
    let fetched = cache.get(&fingerprint, "e1").await.unwrap();
    assert!((fetched.quality() - 0.25).abs() < 1e-9);
}

#[tokio::test]
async fn record_files_shard_by_fingerprint_prefix() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let fingerprint = Candidate::new("Answer carefully.").fingerprint();
    cache
        .set(&fingerprint, "e1", &result_for("e1", 1.0))
        .await
        .unwrap();
    let expected = dir
        .path()
        .join("cache")
        .join(fingerprint.prefix())
        .join(format!("{}.jsonl", fingerprint.to_hex()));
    assert!(expected.exists());
}

#[tokio::test]
async fn concurrent_writers_on_one_fingerprint_do_not_interleave() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let fingerprint = Candidate::new("Answer carefully.").fingerprint();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let cache = cache.clone();
        tasks.push(tokio::spawn(async move {
            let example_id = format!("e{i}");
            cache
                .set(&fingerprint, &example_id, &result_for(&example_id, 1.0))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every line of the record file must parse cleanly: interleaved writes would not.
    let path = dir
        .path()
        .join("cache")
        .join(fingerprint.prefix())
        .join(format!("{}.jsonl", fingerprint.to_hex()));
    let contents = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 20);
    for line in lines {
        serde_json::from_str::<serde_json::Value>(line).unwrap();
    }
}

#[tokio::test]
async fn batch_set_groups_by_fingerprint() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let fp_a = Candidate::new("Prompt A").fingerprint();
    let fp_b = Candidate::new("Prompt B").fingerprint();

    let writes = vec![
        (fp_a, "e1".to_owned(), result_for("e1", 1.0)),
        (fp_a, "e2".to_owned(), result_for("e2", 0.5)),
        (fp_b, "e1".to_owned(), result_for("e1", 0.0)),
    ];
    cache.batch_set(writes).await.unwrap();

    assert!(cache.get(&fp_a, "e1").await.is_some());
    assert!(cache.get(&fp_a, "e2").await.is_some());
    assert!((cache.get(&fp_b, "e1").await.unwrap().quality() - 0.0).abs() < 1e-9);
}

#[tokio::test]
async fn unreadable_lines_are_skipped() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let fingerprint = Candidate::new("Answer carefully.").fingerprint();
    cache
        .set(&fingerprint, "e1", &result_for("e1", 1.0))
        .await
        .unwrap();

    // Simulate a torn append from a crashed process, then a later good record.
    let path = dir
        .path()
        .join("cache")
        .join(fingerprint.prefix())
        .join(format!("{}.jsonl", fingerprint.to_hex()));
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "{{\"example_id\": \"e2\", \"objec").unwrap();
    drop(file);

    let fresh = new_cache(&dir);
    assert!(fresh.get(&fingerprint, "e1").await.is_some());
    assert_eq!(fresh.get(&fingerprint, "e2").await, None);
}

#[tokio::test]
async fn state_round_trip() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    assert!(!cache.has_state());
    assert_eq!(cache.load_state().await, None);

    let state = PersistedState {
        round: 3,
        evaluations: 120,
        pareto: vec![Candidate::new("Best prompt so far.")],
        qd: vec![Candidate::new("A diverse prompt.")],
        queue: vec![Candidate::new("A pending prompt.")],
    };
    cache.save_state(&state).await;
    assert!(cache.has_state());
    assert_eq!(cache.load_state().await, Some(state));

    cache.clear_state();
    assert!(!cache.has_state());
    assert_eq!(cache.load_state().await, None);
}

#[tokio::test]
async fn corrupted_state_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    std::fs::write(
        dir.path().join("cache").join("orchestrator_state.json"),
        b"{not json",
    )
    .unwrap();
    assert_eq!(cache.load_state().await, None);
}

#[tokio::test]
async fn clear_removes_all_records() {
    let dir = TempDir::new().unwrap();
    let cache = new_cache(&dir);
    let fingerprint = Candidate::new("Answer carefully.").fingerprint();
    cache
        .set(&fingerprint, "e1", &result_for("e1", 1.0))
        .await
        .unwrap();
    cache.clear().unwrap();

    let fresh = new_cache(&dir);
    assert_eq!(fresh.get(&fingerprint, "e1").await, None);
}

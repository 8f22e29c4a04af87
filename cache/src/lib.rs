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

use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use candidates::{Candidate, EvalResult, Trace};
use hashing::Fingerprint;
use task_executor::Executor;

const WRITE_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const STATE_FILE_NAME: &str = "orchestrator_state.json";

#[derive(Debug)]
pub enum CacheError {
    Io(String),
    CorruptState(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Io(msg) => write!(f, "Cache I/O failure: {msg}"),
            CacheError::CorruptState(msg) => write!(f, "Corrupted state file: {msg}"),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

///
/// The on-disk shape of one evaluation record: one JSON object per line of a
/// fingerprint's record file.
///
#[derive(Serialize, Deserialize)]
struct CacheRecord {
    example_id: String,
    objectives: std::collections::BTreeMap<String, f64>,
    traces: Vec<Trace>,
    n_examples: usize,
    shard_fraction: Option<f64>,
}

impl CacheRecord {
    fn from_result(example_id: &str, result: &EvalResult) -> CacheRecord {
        CacheRecord {
            example_id: example_id.to_owned(),
            objectives: result.objectives.clone(),
            traces: result.traces.clone(),
            n_examples: result.n_examples,
            shard_fraction: result.shard_fraction,
        }
    }

    fn into_result(self) -> (String, EvalResult) {
        let example_id = self.example_id;
        let result = EvalResult {
            objectives: self.objectives,
            traces: self.traces,
            n_examples: self.n_examples,
            shard_fraction: self.shard_fraction,
            example_ids: vec![example_id.clone()],
        };
        (example_id, result)
    }
}

///
/// Orchestrator state persisted between rounds so that an interrupted run resumes where
/// it left off. Candidates serialize as `{text, meta}`.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub round: usize,
    pub evaluations: usize,
    pub pareto: Vec<Candidate>,
    pub qd: Vec<Candidate>,
    pub queue: Vec<Candidate>,
}

///
/// A content-addressed, append-only store mapping `(fingerprint, example id)` to an
/// evaluation result.
///
/// Record files are JSONL, partitioned into subdirectories by the first two hex
/// characters of the fingerprint. One async lock per fingerprint serializes writers on
/// the same file while leaving distinct fingerprints free to write in parallel, and a
/// global semaphore bounds how many record files are open at once. An in-memory index
/// per fingerprint is loaded on first access and updated in place after writes, so each
/// record file is parsed at most once per process.
///
#[derive(Clone)]
pub struct ResultCache {
    cache_dir: PathBuf,
    executor: Executor,
    locks: Arc<Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>>,
    index: Arc<Mutex<HashMap<Fingerprint, HashMap<String, EvalResult>>>>,
    file_semaphore: Arc<Semaphore>,
}

impl ResultCache {
    pub fn new(cache_dir: impl Into<PathBuf>, executor: Executor) -> Result<ResultCache, String> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| format!("Failed to create cache directory {}: {e}", cache_dir.display()))?;
        Ok(ResultCache {
            cache_dir,
            executor,
            locks: Arc::new(Mutex::new(HashMap::new())),
            index: Arc::new(Mutex::new(HashMap::new())),
            file_semaphore: Arc::new(Semaphore::new(safe_file_limit())),
        })
    }

    fn lock_for(&self, fingerprint: &Fingerprint) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(*fingerprint)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn record_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.cache_dir
            .join(fingerprint.prefix())
            .join(format!("{}.jsonl", fingerprint.to_hex()))
    }

    fn state_path(&self) -> PathBuf {
        self.cache_dir.join(STATE_FILE_NAME)
    }

    ///
    /// Fetch a cached result if present. Index hits answer without touching the
    /// filesystem or any lock beyond the index map itself.
    ///
    pub async fn get(&self, fingerprint: &Fingerprint, example_id: &str) -> Option<EvalResult> {
        if let Some(records) = self.index.lock().get(fingerprint) {
            return records.get(example_id).cloned();
        }
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;
        // Another task may have loaded this fingerprint while we waited on its lock.
        if let Some(records) = self.index.lock().get(fingerprint) {
            return records.get(example_id).cloned();
        }
        let records = self.load_records(fingerprint).await;
        let result = records.get(example_id).cloned();
        self.index.lock().insert(*fingerprint, records);
        result
    }

    ///
    /// Persist a new evaluation record. Idempotent per key: a rewrite appends a new line
    /// and the in-memory index keeps the latest value.
    ///
    pub async fn set(
        &self,
        fingerprint: &Fingerprint,
        example_id: &str,
        result: &EvalResult,
    ) -> Result<(), CacheError> {
        let line = encode_record(example_id, result)?;
        let lock = self.lock_for(fingerprint);
        let _guard = lock.lock().await;
        self.ensure_loaded_locked(fingerprint).await;
        self.append_lines(fingerprint, vec![line]).await?;
        self.index
            .lock()
            .entry(*fingerprint)
            .or_default()
            .insert(example_id.to_owned(), indexed_result(example_id, result));
        Ok(())
    }

    ///
    /// Batch write multiple results, grouping by fingerprint so that each record file is
    /// opened once and written under its own lock. Groups for distinct fingerprints are
    /// written in parallel.
    ///
    pub async fn batch_set(
        &self,
        writes: Vec<(Fingerprint, String, EvalResult)>,
    ) -> Result<(), CacheError> {
        let mut by_fingerprint: HashMap<Fingerprint, Vec<(String, EvalResult)>> = HashMap::new();
        for (fingerprint, example_id, result) in writes {
            by_fingerprint
                .entry(fingerprint)
                .or_default()
                .push((example_id, result));
        }

        let write_groups = by_fingerprint.into_iter().map(|(fingerprint, group)| {
            let cache = self.clone();
            async move {
                let mut lines = Vec::with_capacity(group.len());
                for (example_id, result) in &group {
                    lines.push(encode_record(example_id, result)?);
                }
                let lock = cache.lock_for(&fingerprint);
                let _guard = lock.lock().await;
                cache.ensure_loaded_locked(&fingerprint).await;
                cache.append_lines(&fingerprint, lines).await?;
                let mut index = cache.index.lock();
                let records = index.entry(fingerprint).or_default();
                for (example_id, result) in group {
                    let stored = indexed_result(&example_id, &result);
                    records.insert(example_id, stored);
                }
                Ok::<(), CacheError>(())
            }
        });
        futures::future::try_join_all(write_groups).await?;
        Ok(())
    }

    ///
    /// Load a fingerprint's record file into a map, under the caller-held fingerprint
    /// lock. Missing files are empty; unreadable lines are treated as cache misses.
    ///
    async fn ensure_loaded_locked(&self, fingerprint: &Fingerprint) {
        if self.index.lock().contains_key(fingerprint) {
            return;
        }
        let records = self.load_records(fingerprint).await;
        self.index.lock().insert(*fingerprint, records);
    }

    async fn load_records(&self, fingerprint: &Fingerprint) -> HashMap<String, EvalResult> {
        let path = self.record_path(fingerprint);
        let _permit = match self.file_semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return HashMap::new(),
        };
        self.executor
            .spawn_blocking(
                move || read_record_file(&path),
                |e| {
                    log::warn!("Cache read task failed: {e}");
                    HashMap::new()
                },
            )
            .await
    }

    async fn append_lines(
        &self,
        fingerprint: &Fingerprint,
        lines: Vec<String>,
    ) -> Result<(), CacheError> {
        let path = self.record_path(fingerprint);
        let _permit = self
            .file_semaphore
            .acquire()
            .await
            .map_err(|_| CacheError::Io("file semaphore closed".to_owned()))?;
        self.executor
            .spawn_blocking(
                move || append_with_retry(&path, &lines),
                |e| Err(CacheError::Io(format!("cache write task failed: {e}"))),
            )
            .await
    }

    ///
    /// Atomically persist orchestrator state via temp-file + rename. A failure after all
    /// retries is logged and swallowed: losing a checkpoint is recoverable, aborting the
    /// run is not.
    ///
    pub async fn save_state(&self, state: &PersistedState) {
        let payload = match serde_json::to_vec_pretty(state) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("Failed to serialize orchestrator state: {e}");
                return;
            }
        };
        let state_path = self.state_path();
        let temp_path = state_path.with_extension("tmp");
        let outcome = self
            .executor
            .spawn_blocking(
                move || {
                    with_retry(|| {
                        std::fs::write(&temp_path, &payload)?;
                        std::fs::rename(&temp_path, &state_path)?;
                        Ok(())
                    })
                },
                |e| Err(CacheError::Io(format!("state write task failed: {e}"))),
            )
            .await;
        if let Err(e) = outcome {
            log::warn!("Failed to save orchestrator state after {WRITE_ATTEMPTS} attempts: {e}");
        }
    }

    ///
    /// Load saved orchestrator state, or None if no state exists. A corrupted or
    /// unreadable state file logs a warning and returns None so the run starts fresh.
    ///
    pub async fn load_state(&self) -> Option<PersistedState> {
        let state_path = self.state_path();
        if !state_path.exists() {
            return None;
        }
        let outcome = self
            .executor
            .spawn_blocking(
                move || {
                    let payload = with_retry(|| Ok(std::fs::read(&state_path)?))?;
                    serde_json::from_slice::<PersistedState>(&payload)
                        .map_err(|e| CacheError::CorruptState(e.to_string()))
                },
                |e| Err(CacheError::Io(format!("state read task failed: {e}"))),
            )
            .await;
        match outcome {
            Ok(state) => Some(state),
            Err(e @ CacheError::CorruptState(_)) => {
                log::warn!("{e}; starting fresh");
                None
            }
            Err(e) => {
                log::warn!("Failed to load orchestrator state: {e}; starting fresh");
                None
            }
        }
    }

    pub fn has_state(&self) -> bool {
        self.state_path().exists()
    }

    pub fn clear_state(&self) {
        let state_path = self.state_path();
        if state_path.exists() {
            if let Err(e) = std::fs::remove_file(&state_path) {
                log::warn!("Failed to delete state file {}: {e}", state_path.display());
            }
        }
    }

    ///
    /// Remove all cached record files and the in-memory index. Only used by tests.
    ///
    pub fn clear(&self) -> Result<(), CacheError> {
        self.index.lock().clear();
        if !self.cache_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.cache_dir)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn encode_record(example_id: &str, result: &EvalResult) -> Result<String, CacheError> {
    serde_json::to_string(&CacheRecord::from_result(example_id, result))
        .map_err(|e| CacheError::Io(format!("failed to encode record: {e}")))
}

///
/// The stored rendering of a result under one example id: its `example_ids` always
/// collapse to exactly that id, whatever the caller passed in.
///
fn indexed_result(example_id: &str, result: &EvalResult) -> EvalResult {
    let mut stored = result.clone();
    stored.example_ids = vec![example_id.to_owned()];
    stored
}

fn read_record_file(path: &Path) -> HashMap<String, EvalResult> {
    let mut records = HashMap::new();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to open record file {}: {e}", path.display());
            }
            return records;
        }
    };
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::warn!("Failed to read record file {}: {e}", path.display());
                break;
            }
        };
        match serde_json::from_str::<CacheRecord>(&line) {
            Ok(record) => {
                let (example_id, result) = record.into_result();
                records.insert(example_id, result);
            }
            Err(e) => {
                // A torn append from a crashed process: skip the line, keep the rest.
                log::warn!("Skipping unreadable record in {}: {e}", path.display());
            }
        }
    }
    records
}

fn append_with_retry(path: &Path, lines: &[String]) -> Result<(), CacheError> {
    with_retry(|| {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        file.flush()?;
        Ok(())
    })
}

///
/// Retry a filesystem operation up to WRITE_ATTEMPTS times with exponential backoff.
/// Runs on the blocking pool, so the sleeps are plain thread sleeps.
///
fn with_retry<T>(mut f: impl FnMut() -> Result<T, CacheError>) -> Result<T, CacheError> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e @ CacheError::CorruptState(_)) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= WRITE_ATTEMPTS {
                    return Err(e);
                }
                std::thread::sleep(BACKOFF_BASE * 2_u32.pow(attempt - 1));
            }
        }
    }
}

///
/// A bound on concurrently open record files, derived from the process's soft file
/// descriptor limit: reserve half the limit for other uses, assume up to 8 cache
/// instances, and clamp to [10, 50].
///
fn safe_file_limit() -> usize {
    match rlimit::Resource::NOFILE.get() {
        Ok((soft, _hard)) => {
            let usable = (soft / 2) as usize;
            (usable / 8).clamp(10, 50)
        }
        Err(_) => 20,
    }
}

#[cfg(test)]
mod tests;

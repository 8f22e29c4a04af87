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
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hashing::Fingerprint;

pub const QUALITY: &str = "quality";
pub const NEG_COST: &str = "neg_cost";
pub const TOKENS: &str = "tokens";

/// Model outputs recorded in traces are truncated to this many characters to keep record
/// files and reflection prompts lean.
pub const MAX_TRACE_OUTPUT_LEN: usize = 2048;

///
/// Where a candidate came from. Stored in metadata so that evolution statistics and
/// staged optimization can distinguish seeds from mutations and migrants.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Seed,
    SeedPhase1,
    Phase2Seed,
    Mutation,
    Migration,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Seed => "seed",
            Source::SeedPhase1 => "seed_phase1",
            Source::Phase2Seed => "phase2_seed",
            Source::Mutation => "mutation",
            Source::Migration => "migration",
        };
        write!(f, "{s}")
    }
}

///
/// Candidate metadata: the known, performance-affecting fields are typed, and anything
/// else lands in the `extra` overflow map. All of it participates in the fingerprint,
/// so changing `temperature` (or any other field) produces a distinct cache identity.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_fingerprint: Option<Fingerprint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_objectives: Option<BTreeMap<String, f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub island: Option<usize>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CandidateMeta {
    ///
    /// Render this metadata as a canonical JSON object: lexicographically sorted keys,
    /// absent fields omitted, strings whitespace-normalized, nested maps recursively
    /// canonicalized.
    ///
    fn canonical_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(island) = self.island {
            map.insert("island".to_owned(), Value::from(island));
        }
        if let Some(parent) = &self.parent_fingerprint {
            map.insert("parent_fingerprint".to_owned(), Value::from(parent.to_hex()));
        }
        if let Some(objectives) = &self.parent_objectives {
            let entries = objectives
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(*v)))
                .collect::<serde_json::Map<_, _>>();
            map.insert("parent_objectives".to_owned(), Value::Object(entries));
        }
        if let Some(source) = self.source {
            map.insert("source".to_owned(), Value::from(source.to_string()));
        }
        if let Some(temperature) = self.temperature {
            map.insert("temperature".to_owned(), Value::from(temperature));
        }
        for (key, value) in &self.extra {
            map.insert(key.clone(), canonicalize_value(value));
        }
        Value::Object(map)
    }

    pub fn parent_quality(&self) -> Option<f64> {
        self.parent_objectives
            .as_ref()
            .and_then(|objectives| objectives.get(QUALITY).copied())
    }
}

fn canonicalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::from(normalize_whitespace(s)),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_value).collect()),
        // serde_json's default Map is a BTreeMap, so rebuilding the object sorts its keys.
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

///
/// Collapse all runs of whitespace to single spaces, so that formatting-only edits to a
/// prompt do not change its identity.
///
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

///
/// An optimizer candidate: an instruction string plus metadata. Immutable once created;
/// derived candidates are built with the `with_*` methods.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    #[serde(default)]
    pub meta: CandidateMeta,
}

impl Candidate {
    pub fn new(text: impl Into<String>) -> Candidate {
        Candidate {
            text: text.into(),
            meta: CandidateMeta::default(),
        }
    }

    pub fn with_meta(text: impl Into<String>, meta: CandidateMeta) -> Candidate {
        Candidate {
            text: text.into(),
            meta,
        }
    }

    pub fn with_source(mut self, source: Source) -> Candidate {
        self.meta.source = Some(source);
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Candidate {
        self.meta.temperature = temperature;
        self
    }

    pub fn with_island(mut self, island: usize) -> Candidate {
        self.meta.island = Some(island);
        self
    }

    ///
    /// The canonical JSON payload hashed to produce this candidate's fingerprint:
    /// `{"meta": <canonical meta>, "text": <whitespace-normalized text>}` in compact form
    /// with sorted keys.
    ///
    pub fn canonical_payload(&self) -> Vec<u8> {
        let mut map = serde_json::Map::new();
        map.insert("meta".to_owned(), self.meta.canonical_value());
        map.insert(
            "text".to_owned(),
            Value::from(normalize_whitespace(&self.text)),
        );
        serde_json::to_vec(&Value::Object(map)).expect("canonical payload is always valid JSON")
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_bytes(&self.canonical_payload())
    }
}

///
/// One per-example record retained from an evaluation. Only the fields the reflection
/// prompt consumes are kept; model output is truncated at construction.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub example_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Trace {
    pub fn new(example_id: impl Into<String>) -> Trace {
        Trace {
            example_id: example_id.into(),
            ..Trace::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Trace {
        let output: String = output.into();
        let truncated = if output.chars().count() > MAX_TRACE_OUTPUT_LEN {
            let mut s: String = output.chars().take(MAX_TRACE_OUTPUT_LEN).collect();
            s.push('…');
            s
        } else {
            output
        };
        self.output = Some(truncated);
        self
    }
}

///
/// The averaged outcome of evaluating a candidate over some set of examples. All
/// objectives are maximized; costs are negated upstream.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub objectives: BTreeMap<String, f64>,
    pub traces: Vec<Trace>,
    pub n_examples: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub example_ids: Vec<String>,
}

impl EvalResult {
    pub fn objective(&self, key: &str) -> Option<f64> {
        self.objectives.get(key).copied()
    }

    pub fn quality(&self) -> f64 {
        self.objective(QUALITY).unwrap_or(0.0)
    }

    ///
    /// Combine two results by weight-averaging objectives by `n_examples` and
    /// concatenating traces and example ids. The left result's shard fraction wins.
    ///
    pub fn merge(&self, other: &EvalResult) -> EvalResult {
        let total = self.n_examples + other.n_examples;
        let denominator = total.max(1) as f64;
        let mut combined: BTreeMap<String, f64> = BTreeMap::new();
        for (key, value) in &self.objectives {
            *combined.entry(key.clone()).or_insert(0.0) += value * self.n_examples as f64;
        }
        for (key, value) in &other.objectives {
            *combined.entry(key.clone()).or_insert(0.0) += value * other.n_examples as f64;
        }
        for value in combined.values_mut() {
            *value /= denominator;
        }
        let mut traces = self.traces.clone();
        traces.extend(other.traces.iter().cloned());
        let mut example_ids = self.example_ids.clone();
        example_ids.extend(other.example_ids.iter().cloned());
        EvalResult {
            objectives: combined,
            traces,
            n_examples: total,
            shard_fraction: self.shard_fraction,
            example_ids,
        }
    }
}

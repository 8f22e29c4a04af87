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

use std::fmt;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;

use candidates::Trace;

pub const DEFAULT_REFLECTION_TIMEOUT: Duration = Duration::from_secs(180);
/// At most this many parents are presented per reflection call.
pub const MAX_PARENTS_PER_REFLECTION: usize = 5;
const MAX_EXAMPLES_PER_REFLECTION: usize = 5;
const MAX_EXAMPLES_PER_INDUCTION: usize = 3;
const MIN_MUTATION_CHARS: usize = 50;
/// The deterministic temperature jitter cycle applied to children in phase 2.
const TEMPERATURE_STEPS: [f64; 3] = [-0.2, 0.0, 0.2];

#[derive(Debug)]
pub enum ModelError {
    Timeout,
    Rejected(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Timeout => write!(f, "reflection model call timed out"),
            ModelError::Rejected(msg) => write!(f, "reflection model call failed: {msg}"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    System,
    User,
}

#[derive(Clone, Debug)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct Completion {
    pub text: String,
    pub tokens: u64,
}

///
/// The LLM client boundary: one async completion call. HTTP plumbing, auth, and retry
/// against the provider all live behind this trait.
///
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError>;
}

///
/// Shared model capabilities discovered at runtime. Owned by the orchestrator and handed
/// to each component that issues model calls, so that one rejection of the temperature
/// parameter disables it everywhere at once.
///
pub struct ModelContext {
    temperature_supported: AtomicBool,
}

impl ModelContext {
    pub fn new() -> Arc<ModelContext> {
        Arc::new(ModelContext {
            temperature_supported: AtomicBool::new(true),
        })
    }

    pub fn temperature_supported(&self) -> bool {
        self.temperature_supported.load(Ordering::Relaxed)
    }

    pub fn disable_temperature(&self) {
        if self.temperature_supported.swap(false, Ordering::Relaxed) {
            log::warn!("Disabling temperature optimization: model rejected the parameter");
        }
    }
}

/// True when a provider error message indicates the temperature parameter is the
/// problem, rather than auth or networking.
pub fn is_temperature_rejection(message: &str) -> bool {
    let lowered = message.to_lowercase();
    lowered.contains("temperature")
        || lowered.contains("does not support")
        || lowered.contains("not supported")
}

///
/// One parent shown to the reflection model: its prompt, archived quality, shard
/// coverage, optional temperature, and a few informative traces.
///
#[derive(Clone, Debug)]
pub struct ParentContext {
    pub prompt: String,
    pub quality: f64,
    pub shard_fraction: Option<f64>,
    pub temperature: Option<f64>,
    pub traces: Vec<Trace>,
}

/// A raw task example used for spec induction.
#[derive(Clone, Debug)]
pub struct TaskExample {
    pub input: String,
    pub answer: String,
    pub additional_context: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct MutationStats {
    pub requested: usize,
    pub generated: usize,
}

#[derive(Clone, Debug)]
pub struct MutationConfig {
    pub max_mutations: usize,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub timeout: Duration,
}

impl Default for MutationConfig {
    fn default() -> MutationConfig {
        MutationConfig {
            max_mutations: 4,
            max_tokens: Some(24_000),
            temperature: None,
            timeout: DEFAULT_REFLECTION_TIMEOUT,
        }
    }
}

///
/// Turns archived parents and their traces into new child instructions by prompting the
/// reflection model, and seeds fresh instructions from raw examples via spec induction.
///
/// Both operations recover from models that reject the temperature parameter: the call
/// is retried once without it and the shared ModelContext flag is flipped so no later
/// call sends it again.
///
pub struct Mutator {
    config: MutationConfig,
    model: Arc<dyn ChatModel>,
    context: Arc<ModelContext>,
    temperature_mutations_enabled: AtomicBool,
    prompt_block_re: Regex,
    stats: Mutex<MutationStats>,
}

impl Mutator {
    pub fn new(
        config: MutationConfig,
        model: Arc<dyn ChatModel>,
        context: Arc<ModelContext>,
    ) -> Mutator {
        Mutator {
            config,
            model,
            context,
            temperature_mutations_enabled: AtomicBool::new(false),
            prompt_block_re: Regex::new(r"(?is)<PROMPT>\s*(.*?)\s*</PROMPT>")
                .expect("static regex must compile"),
            stats: Mutex::new(MutationStats::default()),
        }
    }

    pub fn set_temperature_mutations_enabled(&self, enabled: bool) {
        self.temperature_mutations_enabled
            .store(enabled, Ordering::Relaxed);
    }

    pub fn temperature_mutations_enabled(&self) -> bool {
        self.temperature_mutations_enabled.load(Ordering::Relaxed)
            && self.context.temperature_supported()
    }

    pub fn stats(&self) -> MutationStats {
        *self.stats.lock()
    }

    ///
    /// The temperature a child at `index` inherits from its primary parent: none at all
    /// outside phase 2, and a deterministic ±0.2 jitter around the parent's value when
    /// temperature mutations are enabled.
    ///
    pub fn child_temperature(&self, parent_temperature: Option<f64>, index: usize) -> Option<f64> {
        if !self.temperature_mutations_enabled() {
            return None;
        }
        parent_temperature
            .map(|t| (t + TEMPERATURE_STEPS[index % TEMPERATURE_STEPS.len()]).clamp(0.0, 1.0))
    }

    ///
    /// Batched reflection: present up to five parents with their recent quality and
    /// traces, and ask for exactly `num_mutations` variants wrapped in `<PROMPT>` tags.
    /// Returns the validated child instruction texts, at most `num_mutations` of them.
    ///
    pub async fn reflect(
        &self,
        parents: &[ParentContext],
        num_mutations: usize,
    ) -> Result<Vec<String>, ModelError> {
        if parents.is_empty() || num_mutations == 0 {
            return Ok(Vec::new());
        }
        let num_mutations = num_mutations.min(self.config.max_mutations.max(1));
        self.stats.lock().requested += num_mutations;

        let prompt = build_reflection_prompt(parents, num_mutations);
        let completion = self.complete_with_recovery(prompt).await?;
        let mutations = self.parse_mutations(&completion.text, num_mutations);
        if mutations.is_empty() {
            log::warn!("No valid prompts extracted from reflection output");
        }
        self.stats.lock().generated += mutations.len();
        Ok(mutations)
    }

    ///
    /// Spec induction: generate `num_specs` fresh instruction variants directly from raw
    /// task examples, `---`-separated. Used to seed a run that starts without prompts.
    ///
    pub async fn induce(
        &self,
        examples: &[TaskExample],
        num_specs: usize,
    ) -> Result<Vec<String>, ModelError> {
        if examples.is_empty() || num_specs == 0 {
            return Ok(Vec::new());
        }
        let prompt = build_induction_prompt(examples, num_specs);
        let completion = self.complete_with_recovery(prompt).await?;
        let specs = completion
            .text
            .split("---")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .take(num_specs)
            .map(str::to_owned)
            .collect();
        Ok(specs)
    }

    ///
    /// Issue one completion under the reflection timeout. A temperature rejection drops
    /// the parameter, retries once, and disables temperature globally.
    ///
    async fn complete_with_recovery(&self, prompt: String) -> Result<Completion, ModelError> {
        let mut request = CompletionRequest {
            messages: vec![ChatMessage {
                role: Role::User,
                content: prompt,
            }],
            temperature: None,
            max_tokens: self.config.max_tokens,
        };
        if self.context.temperature_supported() {
            request.temperature = self.config.temperature;
        }

        let sent_temperature = request.temperature.is_some();
        let first = self.timed_complete(request.clone()).await;
        match first {
            Err(ModelError::Rejected(message))
                if sent_temperature && is_temperature_rejection(&message) =>
            {
                self.context.disable_temperature();
                request.temperature = None;
                self.timed_complete(request).await
            }
            other => other,
        }
    }

    async fn timed_complete(&self, request: CompletionRequest) -> Result<Completion, ModelError> {
        match tokio::time::timeout(self.config.timeout, self.model.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout),
        }
    }

    ///
    /// Extract `<PROMPT>` blocks and discard the ones that cannot be instructions: too
    /// short, leading `###` (an answer, not a prompt), or nothing but digits and hashes.
    ///
    fn parse_mutations(&self, content: &str, num_mutations: usize) -> Vec<String> {
        let mut mutations = Vec::new();
        for captures in self.prompt_block_re.captures_iter(content) {
            let cleaned = captures[1].trim();
            if cleaned.len() < MIN_MUTATION_CHARS {
                log::debug!("Skipping mutation: too short ({} chars)", cleaned.len());
                continue;
            }
            if cleaned.starts_with("###") {
                log::debug!("Skipping mutation: looks like an answer, not a prompt");
                continue;
            }
            if cleaned.len() < 100
                && cleaned
                    .chars()
                    .all(|c| c == '#' || c.is_ascii_digit() || c.is_whitespace())
            {
                log::debug!("Skipping mutation: appears to be a number, not a prompt");
                continue;
            }
            mutations.push(cleaned.to_owned());
            if mutations.len() == num_mutations {
                break;
            }
        }
        mutations
    }
}

fn build_reflection_prompt(parents: &[ParentContext], num_mutations: usize) -> String {
    let mut parent_summaries = String::new();
    for (i, parent) in parents.iter().take(MAX_PARENTS_PER_REFLECTION).enumerate() {
        let label = (b'A' + i as u8) as char;
        let recent: Vec<f64> = parent
            .traces
            .iter()
            .filter_map(|trace| trace.quality)
            .take(3)
            .collect();
        let perf_summary = if recent.is_empty() {
            format!("Quality: {:.1}%", parent.quality * 100.0)
        } else {
            let avg = recent.iter().sum::<f64>() / recent.len() as f64;
            format!("Recent avg: {:.1}%", avg * 100.0)
        };
        let temp_info = parent
            .temperature
            .map(|t| format!(", temp={t:.1}"))
            .unwrap_or_default();
        let shard_info = parent
            .shard_fraction
            .map(|f| format!(", shard={:.0}%", f * 100.0))
            .unwrap_or_default();
        let _ = writeln!(
            parent_summaries,
            "PROMPT {label} ({perf_summary}{temp_info}{shard_info}):\n\"{}\"\n",
            parent.prompt,
        );
    }

    let mut example_summaries: Vec<String> = Vec::new();
    let informative = parents
        .iter()
        .flat_map(|parent| parent.traces.iter())
        .filter(|trace| trace.output.is_some() || trace.feedback.is_some())
        .take(MAX_EXAMPLES_PER_REFLECTION);
    for (j, trace) in informative.enumerate() {
        let mut block = String::new();
        let n = j + 1;
        if let Some(input) = &trace.input {
            let _ = writeln!(block, "Example {n} Input: {input}");
        }
        if let Some(output) = &trace.output {
            let _ = writeln!(block, "Example {n} Assistant Output: {output}");
        }
        if let Some(answer) = &trace.expected_answer {
            let _ = writeln!(block, "Example {n} Correct Answer: {answer}");
        }
        if let Some(feedback) = &trace.feedback {
            let _ = writeln!(block, "Example {n} Feedback: {feedback}");
        }
        if let Some(solution) = trace
            .additional_context
            .as_ref()
            .and_then(|context| context.get("solution"))
        {
            let _ = writeln!(block, "Example {n} Reference Solution:\n{solution}");
        }
        example_summaries.push(block.trim_end().to_owned());
    }
    let examples_text = if example_summaries.is_empty() {
        "(no additional examples available)".to_owned()
    } else {
        example_summaries.join("\n\n")
    };

    format!(
        r#"I provided an assistant with the following instructions to perform a task:

Existing high-performing instructions and their recent quality:
{parent_summaries}
The following are examples of different task inputs provided to the assistant along with the assistant's response for each of them, and some feedback on how the assistant's response could be better:

{examples_text}

Your task is to write {num_mutations} new instruction variants for the assistant.

Read the inputs carefully and identify the input format and infer detailed task description about the task I wish to solve with the assistant.

Read all the assistant responses and the corresponding feedback. Identify all niche and domain-specific factual information about the task and include it in the instruction, as a lot of it may not be available to the assistant in the future. The assistant may have utilized a generalizable strategy to solve the task; if so, include that in the instruction as well.

IMPORTANT guidance:
- Extract and include domain-specific factual knowledge, techniques, and patterns from the examples and solutions
- Include key principles, common solution approaches, and problem-solving strategies observed in the reference solutions
- Address common pitfalls and edge cases specific to this problem domain
- Ensure each instruction emphasizes the required answer format

Write {num_mutations} new instruction variants. Each instruction MUST be wrapped in XML tags like this:

<PROMPT>
Your new instruction text here...
</PROMPT>

IMPORTANT:
- Each prompt must be wrapped in <PROMPT></PROMPT> tags
- Do NOT include example answers in your prompts
- Do NOT copy reference solutions - create NEW instructions
- Each prompt should be a complete instruction for solving problems in this domain"#
    )
}

fn build_induction_prompt(examples: &[TaskExample], num_specs: usize) -> String {
    let mut example_summaries: Vec<String> = Vec::new();
    for (i, example) in examples.iter().take(MAX_EXAMPLES_PER_INDUCTION).enumerate() {
        let mut block = String::new();
        let n = i + 1;
        let _ = writeln!(block, "Example {n}:");
        let _ = writeln!(block, "Input: {}", example.input);
        let _ = writeln!(block, "Expected Output: {}", example.answer);
        if let Some(context) = &example.additional_context {
            for (key, value) in context {
                let _ = writeln!(block, "{}: {value}", title_case(key));
            }
        }
        example_summaries.push(block.trim_end().to_owned());
    }
    let all_examples_text = example_summaries.join("\n\n");

    format!(
        r#"Below are {count} examples of a task with full context including reference solutions:

{all_examples_text}

Your task is to generate {num_specs} different instruction variants that would teach an AI assistant to solve tasks like these.

Read the inputs carefully and identify the input format and infer detailed task description.

Read all the reference solutions and identify all niche and domain-specific factual information about the task and include it in the instructions, as a lot of it may not be available to the assistant in the future. Extract generalizable strategies used in the solutions and include those as well.

Each instruction should:
- Be self-contained and clear
- Teach the assistant with domain knowledge and strategies from the examples
- Be different from the others in approach or emphasis

Output format: Return each instruction separated by "---" (exactly {num_specs} instructions)."#,
        count = examples.len().min(MAX_EXAMPLES_PER_INDUCTION),
    )
}

fn title_case(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

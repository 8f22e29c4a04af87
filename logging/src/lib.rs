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

use std::fs::OpenOptions;
use std::path::Path;

use log::LevelFilter;

///
/// Map a config-file log level string to a LevelFilter. Unrecognized values fall back to
/// `warn` rather than erroring, so a typo in a config does not abort a long run.
///
pub fn level_for(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warning" | "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "critical" => LevelFilter::Error,
        _ => LevelFilter::Warn,
    }
}

///
/// Initialize the process-wide logger at the given level, optionally teeing to a log
/// file. Calling this more than once is harmless: later calls are ignored by the `log`
/// facade, which only accepts one global logger.
///
pub fn init(level: LevelFilter, log_path: Option<&Path>) -> Result<(), String> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);

    if let Some(path) = log_path {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create log directory {}: {e}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| format!("Failed to open log file {}: {e}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    if builder.try_init().is_err() {
        log::debug!("Logging already initialized.");
    }
    Ok(())
}

// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use rlimit::Resource;

pub const DESIRED_SOFT_LIMIT: u64 = 4096;

///
/// Raises the soft file-descriptor limit toward 4096 (bounded by the hard limit) for the
/// lifetime of the guard, restoring the original soft limit on drop. Evaluation fan-out
/// plus the cache's record files can exceed conservative default limits.
///
pub struct FdLimitGuard {
    original_soft: Option<u64>,
    hard: u64,
}

impl FdLimitGuard {
    pub fn raise() -> FdLimitGuard {
        match Resource::NOFILE.get() {
            Ok((soft, hard)) => {
                let desired = DESIRED_SOFT_LIMIT.min(hard);
                if soft >= desired {
                    return FdLimitGuard {
                        original_soft: None,
                        hard,
                    };
                }
                match Resource::NOFILE.set(desired, hard) {
                    Ok(()) => {
                        log::debug!("Raised soft file descriptor limit from {soft} to {desired}");
                        FdLimitGuard {
                            original_soft: Some(soft),
                            hard,
                        }
                    }
                    Err(e) => {
                        log::warn!("Could not raise file descriptor limit: {e}");
                        FdLimitGuard {
                            original_soft: None,
                            hard,
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("Could not read file descriptor limit: {e}");
                FdLimitGuard {
                    original_soft: None,
                    hard: 0,
                }
            }
        }
    }
}

impl Drop for FdLimitGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original_soft {
            if let Err(e) = Resource::NOFILE.set(original, self.hard) {
                log::warn!("Could not restore file descriptor limit: {e}");
            }
        }
    }
}

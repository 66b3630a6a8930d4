//! Sandbox-layer errors.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by execution environments
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The caller's per-attempt budget elapsed; the environment is assumed
    /// usable for the next attempt
    #[error("execution timed out after {timeout:?}")]
    Timeout {
        /// The budget that elapsed
        timeout: Duration,
    },

    /// The environment is corrupted or gone; the owning session must be
    /// torn down
    #[error("environment lost: {reason}")]
    EnvironmentLost {
        /// What broke
        reason: String,
    },

    /// The environment never came up
    #[error("environment failed to start: {reason}")]
    LaunchFailed {
        /// What the spawn reported
        reason: String,
    },
}

impl SandboxError {
    /// Whether this error requires session teardown
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EnvironmentLost { .. } | Self::LaunchFailed { .. })
    }

    /// Whether this is a per-attempt timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

//! Stream-layer errors.

use thiserror::Error;

use crate::events::RunId;

/// Errors surfaced by the event hub and run logs
#[derive(Debug, Error)]
pub enum StreamError {
    /// The run was never opened, or its buffer already expired
    #[error("unknown run: {0}")]
    UnknownRun(RunId),

    /// `open_run` called twice for the same id
    #[error("run already open: {0}")]
    AlreadyOpen(RunId),

    /// `publish` after the run's terminal event
    #[error("run closed: {0}")]
    RunClosed(RunId),

    /// The hash chain does not match the recorded events
    #[error("event log integrity violation at seq {seq}")]
    IntegrityViolation {
        /// Sequence number of the first bad record
        seq: u64,
    },

    /// An event could not be canonicalized for hashing
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

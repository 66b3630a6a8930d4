//! Engine error types.

use datalyst_gateway::GatewayError;
use datalyst_sandbox::SandboxError;
use datalyst_session::SessionError;
use datalyst_stream::StreamError;

use crate::machine::TransitionError;

/// Errors surfaced by the orchestrator and its run driver
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Session open, reuse or lifecycle failure
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Sandbox failure reaching the driver directly
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// Event stream failure
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Plan creation failed; nothing was executed
    #[error("planning failed: {reason}")]
    Planning {
        /// What the planner reported
        reason: String,
    },

    /// A non-planning completion failed past its retry
    #[error(transparent)]
    Completion(#[from] GatewayError),

    /// A step burned through its whole retry budget
    #[error("step {step} exhausted its retries: {diagnosis}")]
    StepExhausted {
        /// One-based step number as shown to the user
        step: usize,
        /// The step's instruction
        instruction: String,
        /// The last diagnosis, or the raw error when none was produced
        diagnosis: String,
    },

    /// The driver fed the machine an impossible signal
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Configuration could not be parsed
    #[error("invalid configuration: {reason}")]
    Config {
        /// What was wrong
        reason: String,
    },
}

impl EngineError {
    /// True when the request raced an active run; retry later
    #[must_use]
    pub fn is_run_in_progress(&self) -> bool {
        matches!(self, Self::Session(err) if err.is_run_in_progress())
    }

    /// True when the request named a session, dataset or run that does
    /// not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Session(err) => err.is_not_found(),
            Self::Stream(StreamError::UnknownRun(_)) => true,
            _ => false,
        }
    }
}

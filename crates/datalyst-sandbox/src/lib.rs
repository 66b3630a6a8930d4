//! Datalyst Sandbox - isolated stateful code execution
//!
//! Wraps one isolated, stateful execution environment per session:
//! - `execute(code, budget)` returns captured stdout, stderr and artifacts
//! - Non-empty stderr classifies the attempt failed
//! - Submissions are strictly serialized per environment handle
//! - A timeout fails the attempt but leaves the environment usable
//! - `EnvironmentLost` signals corruption; the owning session must tear down
//!
//! The environment's own variable state persists between calls; nothing else
//! does. The core never assumes in-process access to interpreter internals.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod error;
pub mod output;
pub mod process;

// Re-exports for convenience
pub use error::SandboxError;
pub use output::{Artifact, AttemptOutcome, ExecutionOutput, TableData, CHART_MIME, TABLE_MIME};
pub use process::{ProcessEnvironment, ProcessLauncher, SandboxConfig};

/// One isolated, stateful code-execution environment
#[async_trait]
pub trait Environment: Send + Sync {
    /// Execute one code block under a per-attempt budget
    ///
    /// Implementations serialize concurrent callers; the environment cannot
    /// interleave submissions.
    async fn execute(&self, code: &str, budget: Duration) -> Result<ExecutionOutput, SandboxError>;

    /// Release the environment. Idempotent.
    async fn shutdown(&self) -> Result<(), SandboxError>;
}

/// Produces fresh environments for new sessions
#[async_trait]
pub trait EnvironmentLauncher: Send + Sync {
    /// Start a new, empty environment
    async fn launch(&self) -> Result<Arc<dyn Environment>, SandboxError>;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

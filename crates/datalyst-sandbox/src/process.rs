//! Subprocess-backed execution environment.
//!
//! The interpreter runs as a child process and speaks a line-delimited JSON
//! protocol on stdin/stdout: `{"id", "code"}` in, `{"id", "stdout",
//! "stderr", "artifacts"}` out. Requests carry a monotonically increasing id
//! so a reply that lands after its caller already timed out is discarded
//! instead of being attributed to the next call. One `tokio::sync::Mutex`
//! serializes submissions per handle; the environment does not support
//! concurrent execution.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::output::{Artifact, ExecutionOutput};
use crate::{Environment, EnvironmentLauncher};

/// Interpreter process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter executable; must speak the line protocol
    pub command: String,
    /// Arguments passed to the interpreter
    pub args: Vec<String>,
    /// Per-attempt execution budget in seconds
    pub execute_timeout_secs: u64,
}

impl SandboxConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With interpreter command
    #[inline]
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    /// With interpreter arguments
    #[inline]
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// With a per-attempt budget in seconds
    #[inline]
    #[must_use]
    pub fn with_execute_timeout_secs(mut self, secs: u64) -> Self {
        self.execute_timeout_secs = secs;
        self
    }

    /// Per-attempt execution budget
    #[must_use]
    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.execute_timeout_secs)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string()],
            execute_timeout_secs: 30,
        }
    }
}

#[derive(Serialize)]
struct WireRequest<'a> {
    id: u64,
    code: &'a str,
}

#[derive(Deserialize)]
struct WireReply {
    id: u64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    artifacts: Vec<WireArtifact>,
}

#[derive(Deserialize)]
struct WireArtifact {
    mime: String,
    #[serde(default)]
    data: Value,
}

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// One exclusively owned interpreter child process
pub struct ProcessEnvironment {
    io: Mutex<Option<ChildIo>>,
}

impl ProcessEnvironment {
    /// Spawn the interpreter and wire up its pipes
    pub fn spawn(config: &SandboxConfig) -> Result<Self, SandboxError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::LaunchFailed {
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| SandboxError::LaunchFailed {
            reason: "interpreter stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::LaunchFailed {
            reason: "interpreter stdout unavailable".to_string(),
        })?;

        debug!(command = %config.command, "interpreter spawned");
        Ok(Self {
            io: Mutex::new(Some(ChildIo {
                child,
                stdin,
                lines: BufReader::new(stdout).lines(),
                next_id: 0,
            })),
        })
    }
}

fn lost(reason: impl Into<String>) -> SandboxError {
    SandboxError::EnvironmentLost {
        reason: reason.into(),
    }
}

async fn write_request(io: &mut ChildIo, line: &str) -> Result<(), SandboxError> {
    io.stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|e| lost(format!("request write failed: {e}")))?;
    io.stdin
        .write_all(b"\n")
        .await
        .map_err(|e| lost(format!("request write failed: {e}")))?;
    io.stdin
        .flush()
        .await
        .map_err(|e| lost(format!("request flush failed: {e}")))?;
    Ok(())
}

async fn read_reply(io: &mut ChildIo, id: u64) -> Result<WireReply, SandboxError> {
    loop {
        let line = io
            .lines
            .next_line()
            .await
            .map_err(|e| lost(format!("reply read failed: {e}")))?
            .ok_or_else(|| lost("interpreter exited"))?;
        if line.trim().is_empty() {
            continue;
        }
        let reply: WireReply = serde_json::from_str(line.trim())
            .map_err(|e| lost(format!("unparseable reply: {e}")))?;
        if reply.id < id {
            // Left over from an attempt that timed out.
            warn!(stale = reply.id, current = id, "discarding stale reply");
            continue;
        }
        if reply.id > id {
            return Err(lost(format!(
                "reply id {} overtook request {id}",
                reply.id
            )));
        }
        return Ok(reply);
    }
}

#[async_trait]
impl Environment for ProcessEnvironment {
    async fn execute(&self, code: &str, budget: Duration) -> Result<ExecutionOutput, SandboxError> {
        let mut guard = self.io.lock().await;
        let io = guard
            .as_mut()
            .ok_or_else(|| lost("environment is shut down"))?;

        io.next_id += 1;
        let id = io.next_id;
        let request = serde_json::to_string(&WireRequest { id, code })
            .map_err(|e| lost(format!("request encoding failed: {e}")))?;

        debug!(id, code_len = code.len(), "submitting code block");
        write_request(io, &request).await?;

        match tokio::time::timeout(budget, read_reply(io, id)).await {
            Ok(reply) => {
                let reply = reply?;
                Ok(ExecutionOutput {
                    stdout: reply.stdout,
                    stderr: reply.stderr,
                    artifacts: reply
                        .artifacts
                        .into_iter()
                        .map(|a| Artifact::from_mime(&a.mime, a.data))
                        .collect(),
                })
            }
            Err(_) => {
                warn!(id, ?budget, "attempt timed out");
                Err(SandboxError::Timeout { timeout: budget })
            }
        }
    }

    async fn shutdown(&self) -> Result<(), SandboxError> {
        let mut guard = self.io.lock().await;
        if let Some(io) = guard.take() {
            let ChildIo {
                mut child, stdin, ..
            } = io;
            drop(stdin);
            let _ = child.kill().await;
            debug!("environment shut down");
        }
        Ok(())
    }
}

/// Launches [`ProcessEnvironment`]s from a shared configuration
pub struct ProcessLauncher {
    config: SandboxConfig,
}

impl ProcessLauncher {
    /// Launcher for the given interpreter configuration
    #[must_use]
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// The interpreter configuration in use
    #[must_use]
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

#[async_trait]
impl EnvironmentLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<Arc<dyn Environment>, SandboxError> {
        Ok(Arc::new(ProcessEnvironment::spawn(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_sane() {
        let config = SandboxConfig::default();
        assert_eq!(config.command, "python3");
        assert_eq!(config.execute_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn config_builders_override_fields() {
        let config = SandboxConfig::new()
            .with_command("/bin/sh")
            .with_args(vec!["-c".into(), "true".into()])
            .with_execute_timeout_secs(5);

        assert_eq!(config.command, "/bin/sh");
        assert_eq!(config.args.len(), 2);
        assert_eq!(config.execute_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn wire_reply_fills_missing_fields() {
        let reply: WireReply = serde_json::from_str(r#"{"id": 3}"#).unwrap();
        assert_eq!(reply.id, 3);
        assert!(reply.stdout.is_empty());
        assert!(reply.stderr.is_empty());
        assert!(reply.artifacts.is_empty());
    }
}

//! Testing utilities for the Datalyst workspace
//!
//! Scripted fakes for the completion backend, sandbox environment and
//! dataset catalog, plus reply builders that produce well-formed model text.

#![allow(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use datalyst_gateway::{BackendError, CompletionBackend, CompletionRequest};
use datalyst_sandbox::{Environment, EnvironmentLauncher, ExecutionOutput, SandboxError};
use datalyst_session::{
    ColumnProfile, DatasetCatalog, DatasetPayload, DatasetProfile, SessionError, SessionId,
    SnapshotStore,
};

/// Completion backend that replays a fixed script of replies.
///
/// Every request is recorded; an exhausted script reports a backend failure.
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, BackendError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn from_texts(replies: Vec<String>) -> Arc<Self> {
        Self::new(replies.into_iter().map(Ok).collect())
    }

    pub fn push_reply(&self, reply: Result<String, BackendError>) {
        self.replies.lock().push_back(reply);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    async fn complete(&self, request: CompletionRequest) -> Result<String, BackendError> {
        self.requests.lock().push(request);
        match self.replies.lock().pop_front() {
            Some(reply) => reply,
            None => Err(BackendError::new("completion script exhausted")),
        }
    }
}

/// Sandbox environment that replays a fixed script of execution outcomes.
///
/// Executed code is recorded in order. An exhausted script succeeds with
/// empty output so incidental executions (priming, cleanup) need no entries.
pub struct ScriptedEnvironment {
    outcomes: Mutex<VecDeque<Result<ExecutionOutput, SandboxError>>>,
    executed: Mutex<Vec<String>>,
    shutdowns: Mutex<usize>,
}

impl ScriptedEnvironment {
    pub fn new(outcomes: Vec<Result<ExecutionOutput, SandboxError>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            executed: Mutex::new(Vec::new()),
            shutdowns: Mutex::new(0),
        })
    }

    pub fn idle() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn push_outcome(&self, outcome: Result<ExecutionOutput, SandboxError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        *self.shutdowns.lock()
    }
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    async fn execute(
        &self,
        code: &str,
        _budget: Duration,
    ) -> Result<ExecutionOutput, SandboxError> {
        self.executed.lock().push(code.to_string());
        match self.outcomes.lock().pop_front() {
            Some(outcome) => outcome,
            None => Ok(ExecutionOutput::from_stdout("")),
        }
    }

    async fn shutdown(&self) -> Result<(), SandboxError> {
        *self.shutdowns.lock() += 1;
        Ok(())
    }
}

/// Launcher that hands out pre-built scripted environments in order,
/// then idle ones.
pub struct ScriptedLauncher {
    queued: Mutex<VecDeque<Arc<ScriptedEnvironment>>>,
    launched: Mutex<Vec<Arc<ScriptedEnvironment>>>,
}

impl ScriptedLauncher {
    pub fn new(environments: Vec<Arc<ScriptedEnvironment>>) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(environments.into()),
            launched: Mutex::new(Vec::new()),
        })
    }

    pub fn single(environment: Arc<ScriptedEnvironment>) -> Arc<Self> {
        Self::new(vec![environment])
    }

    pub fn launched(&self) -> Vec<Arc<ScriptedEnvironment>> {
        self.launched.lock().clone()
    }
}

#[async_trait]
impl EnvironmentLauncher for ScriptedLauncher {
    async fn launch(&self) -> Result<Arc<dyn Environment>, SandboxError> {
        let env = self
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(ScriptedEnvironment::idle);
        self.launched.lock().push(Arc::clone(&env));
        Ok(env)
    }
}

/// In-memory dataset catalog keyed by reference string.
pub struct StaticCatalog {
    datasets: HashMap<String, DatasetPayload>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self {
            datasets: HashMap::new(),
        }
    }

    pub fn with_dataset(mut self, name: &str, payload: DatasetPayload) -> Self {
        self.datasets.insert(name.to_string(), payload);
        self
    }

    pub fn with_sample(self, name: &str) -> Self {
        let payload = DatasetPayload {
            profile: sample_profile(name),
            bytes: b"snapshot".to_vec(),
        };
        self.with_dataset(name, payload)
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatasetCatalog for StaticCatalog {
    async fn fetch(&self, dataset: &str) -> Result<DatasetPayload, SessionError> {
        self.datasets
            .get(dataset)
            .cloned()
            .ok_or_else(|| SessionError::DatasetNotFound {
                dataset: dataset.to_string(),
            })
    }
}

/// In-memory snapshot store with the same write-once contract as the
/// filesystem one. Paths it returns are virtual.
pub struct MemorySnapshots {
    files: Mutex<HashMap<SessionId, Vec<u8>>>,
}

impl MemorySnapshots {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.files.lock().contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl Default for MemorySnapshots {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshots {
    async fn write(&self, session_id: SessionId, bytes: &[u8]) -> Result<PathBuf, SessionError> {
        let mut files = self.files.lock();
        if files.contains_key(&session_id) {
            return Err(SessionError::Snapshot {
                reason: format!("snapshot already exists for {session_id}"),
            });
        }
        files.insert(session_id, bytes.to_vec());
        Ok(PathBuf::from(format!("/virtual/{session_id}.snapshot")))
    }

    async fn remove(&self, session_id: SessionId) -> Result<(), SessionError> {
        self.files.lock().remove(&session_id);
        Ok(())
    }
}

/// A small profile for a fleet-style dataset.
pub fn sample_profile(name: &str) -> DatasetProfile {
    DatasetProfile {
        name: name.to_string(),
        row_count: 1_200,
        columns: vec![
            ColumnProfile {
                name: "Driver".to_string(),
                dtype: "object".to_string(),
                description: None,
            },
            ColumnProfile {
                name: "Fuel".to_string(),
                dtype: "float64".to_string(),
                description: Some("litres per trip".to_string()),
            },
        ],
    }
}

/// A well-formed planner reply: a fenced JSON array of steps.
pub fn plan_reply(steps: &[&str]) -> String {
    let array = serde_json::to_string(steps).unwrap();
    format!("```json\n{array}\n```")
}

/// A well-formed code-generator reply.
pub fn code_reply(thought: &str, code: &str) -> String {
    serde_json::json!({ "thought": thought, "code": code }).to_string()
}

/// A well-formed error-analyzer reply.
pub fn diagnosis_reply(diagnosis: &str, suggestion: &str) -> String {
    serde_json::json!({ "diagnosis": diagnosis, "suggestion": suggestion }).to_string()
}

/// A well-formed chart-generator reply.
pub fn chart_reply(code: &str) -> String {
    serde_json::json!({ "code": code }).to_string()
}

/// A successful execution whose stdout is the given text.
pub fn stdout_output(stdout: &str) -> ExecutionOutput {
    ExecutionOutput::from_stdout(stdout)
}

/// A failed execution with the given stderr.
pub fn stderr_output(stderr: &str) -> ExecutionOutput {
    ExecutionOutput::from_stderr(stderr)
}

/// A successful execution carrying a table artifact.
pub fn table_output(columns: &[&str], rows: usize) -> ExecutionOutput {
    let table = datalyst_sandbox::TableData {
        columns: columns.iter().map(|c| (*c).to_string()).collect(),
        rows: (0..rows)
            .map(|i| {
                columns
                    .iter()
                    .map(|c| serde_json::json!(format!("{c}{i}")))
                    .collect()
            })
            .collect(),
        row_count: rows,
    };
    ExecutionOutput::from_stdout("table ready")
        .with_artifact(datalyst_sandbox::Artifact::Table(table))
}

/// A successful execution carrying a chart artifact.
pub fn chart_output(spec: serde_json::Value) -> ExecutionOutput {
    ExecutionOutput::from_stdout("chart ready").with_artifact(datalyst_sandbox::Artifact::Chart(spec))
}

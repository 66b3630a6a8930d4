//! The orchestrator facade: the one seam a server layer talks to.
//!
//! Wires the gateway, session store and event hub together. `submit` claims
//! the session's run slot, opens the run's event buffer and spawns the
//! driver; everything after that is observed through `subscribe`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::info;

use datalyst_gateway::{CompletionBackend, Gateway, HistoryTurn};
use datalyst_sandbox::{EnvironmentLauncher, ProcessLauncher};
use datalyst_session::{DatasetCatalog, SessionId, SessionInfo, SessionStore, SnapshotStore};
use datalyst_stream::{EventHub, EventStream, RunId};

use crate::config::EngineConfig;
use crate::driver::RunDriver;
use crate::error::EngineError;

/// One question against one dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Session to continue; absent or stale ids get a fresh session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Dataset reference to analyze
    pub dataset: String,
    /// The user's natural-language question
    pub query: String,
    /// Prior conversation to seed a fresh session with; ignored when an
    /// existing session is reused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryTurn>>,
}

impl QueryRequest {
    /// A request with no session affinity
    #[must_use]
    pub fn new(dataset: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            session_id: None,
            dataset: dataset.into(),
            query: query.into(),
            history: None,
        }
    }

    /// Continue the given session
    #[inline]
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Seed a fresh session with prior conversation
    #[inline]
    #[must_use]
    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = Some(history);
        self
    }
}

/// Receipt for an accepted query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAccepted {
    /// The session the run executes in; fresh ids surface here
    pub session_id: SessionId,
    /// Handle for subscribing to the run's event stream
    pub run_id: RunId,
}

/// Wires sessions, completions and event streaming into one workflow
pub struct Orchestrator {
    store: Arc<SessionStore>,
    gateway: Arc<Gateway>,
    hub: Arc<EventHub>,
    runs: Arc<DashMap<RunId, SessionId>>,
    config: EngineConfig,
}

impl Orchestrator {
    /// Build an orchestrator over explicit seams
    #[must_use]
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        catalog: Arc<dyn DatasetCatalog>,
        snapshots: Arc<dyn SnapshotStore>,
        launcher: Arc<dyn EnvironmentLauncher>,
        config: EngineConfig,
    ) -> Self {
        let gateway = Arc::new(Gateway::new(backend, config.gateway.clone()));
        let store = Arc::new(SessionStore::new(
            catalog,
            snapshots,
            launcher,
            config.session.clone(),
        ));
        let hub = Arc::new(EventHub::new(&config.stream.to_stream_config()));
        Self {
            store,
            gateway,
            hub,
            runs: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Build an orchestrator launching interpreter subprocesses per session
    #[must_use]
    pub fn with_process_sandbox(
        backend: Arc<dyn CompletionBackend>,
        catalog: Arc<dyn DatasetCatalog>,
        snapshots: Arc<dyn SnapshotStore>,
        config: EngineConfig,
    ) -> Self {
        let launcher = Arc::new(ProcessLauncher::new(config.sandbox.clone()));
        Self::new(backend, catalog, snapshots, launcher, config)
    }

    /// Current configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The event hub, for embedding layers that stream directly
    #[inline]
    #[must_use]
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    /// The session store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Accept a query: resolve the session, claim its run slot and spawn
    /// the driver.
    ///
    /// Returns as soon as the run is claimed; progress arrives through
    /// [`subscribe`](Self::subscribe). A busy session fails fast with
    /// [`SessionError::RunInProgress`](datalyst_session::SessionError).
    pub async fn submit(&self, request: QueryRequest) -> Result<QueryAccepted, EngineError> {
        let entry = self.store.open(request.session_id, &request.dataset).await?;
        let session_id = entry.session_id();

        let fresh = request.session_id != Some(session_id);
        if fresh {
            if let Some(history) = &request.history {
                for turn in history {
                    self.store.record_exchange(session_id, &turn.query, &turn.answer);
                }
            }
        }

        let guard = self.store.begin_run(session_id)?;
        let run_id = guard.run_id();
        self.hub.open_run(run_id)?;
        self.runs.insert(run_id, session_id);

        let driver = RunDriver::new(
            Arc::clone(&self.gateway),
            Arc::clone(&self.hub),
            Arc::clone(&self.store),
            self.config.retry,
            self.config.sandbox.execute_timeout(),
            self.config.gateway.max_result_chars,
            request.query.clone(),
            guard,
        );
        let runs = Arc::clone(&self.runs);
        tokio::spawn(async move {
            driver.run().await;
            runs.remove(&run_id);
        });

        info!(%session_id, %run_id, "query accepted");
        Ok(QueryAccepted { session_id, run_id })
    }

    /// Replay a run's events from the beginning, then follow it live
    pub async fn subscribe(&self, run_id: RunId) -> Result<EventStream, EngineError> {
        Ok(self.hub.subscribe(run_id).await?)
    }

    /// Ask a run to stop at its next safe boundary.
    /// Returns false when the run is not currently active.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.runs.get(&run_id) {
            Some(entry) => self.store.signal_cancel(*entry.value(), run_id),
            None => false,
        }
    }

    /// Recompute the hash chain over a run's buffered events
    pub async fn verify_run_integrity(&self, run_id: RunId) -> Result<(), EngineError> {
        Ok(self.hub.verify_integrity(run_id).await?)
    }

    /// Open sessions, most recently active last
    #[must_use]
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.store.list()
    }

    /// Close a session and release its environment and snapshot
    pub async fn close_session(&self, session_id: SessionId) -> Result<(), EngineError> {
        Ok(self.store.close(session_id).await?)
    }

    /// Close every session idle past the configured timeout
    pub async fn sweep_sessions(&self) -> usize {
        self.store.sweep(Utc::now()).await
    }

    /// Spawn the background reaper over the session store
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        self.store.spawn_reaper()
    }
}

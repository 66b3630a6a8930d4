//! The session store: dataset-bound environments with run exclusivity.
//!
//! Each session owns one live interpreter environment primed with its dataset
//! snapshot. Sessions are independent; the store's map is sharded so opens,
//! touches and closes on different sessions never contend. Within a session,
//! a tokio mutex guarantees at most one active run, and a watch channel lets
//! close and cancel interrupt that run at its next safe boundary.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use datalyst_sandbox::{Environment, EnvironmentLauncher};
use datalyst_stream::RunId;

use crate::dataset::{DatasetCatalog, DatasetProfile};
use crate::error::SessionError;
use crate::snapshot::SnapshotStore;

/// Unique identifier for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generate a fresh random id
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One completed query/answer pair in a session's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    /// What the user asked
    pub query: String,
    /// The final answer the run produced
    pub answer: String,
    /// When the exchange was recorded
    pub asked_at: DateTime<Utc>,
}

/// Listing entry for an open session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Session identifier
    pub session_id: SessionId,
    /// Dataset the session is bound to
    pub dataset_ref: String,
    /// When the session was opened
    pub created_at: DateTime<Utc>,
    /// Last touch, the reaper's idle clock
    pub last_activity: DateTime<Utc>,
}

/// Where a session is in its life.
///
/// `touch` revives an `Idle` session; `Terminating` and `Terminated` are
/// one-way. The reaper marks a session `Idle` just before closing it, so a
/// concurrent observer sees the intermediate state rather than a vanishing
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Open and recently used
    Active,
    /// Open but past the idle threshold
    Idle,
    /// Close has begun; the run slot is draining
    Terminating,
    /// Resources released; the entry is gone from the store
    Terminated,
}

/// Default prime code; `{var}` and `{path}` are substituted at open
pub const DEFAULT_PRIME_TEMPLATE: &str = "\
import pandas as pd
{var} = pd.read_parquet(r'{path}')
print({var}.shape)
";

/// Session store tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle seconds before the reaper closes a session
    pub idle_timeout_secs: u64,
    /// Seconds between reaper sweeps
    pub sweep_interval_secs: u64,
    /// Budget in seconds for the snapshot-loading prime execution
    pub init_timeout_secs: u64,
    /// Code run once at open; `{var}` and `{path}` are substituted
    pub prime_template: String,
    /// Variable name the dataset is loaded under
    pub frame_variable: String,
}

impl SessionConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a custom idle timeout
    #[inline]
    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    /// With a custom sweep interval
    #[inline]
    #[must_use]
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    /// With a custom prime budget
    #[inline]
    #[must_use]
    pub fn with_init_timeout_secs(mut self, secs: u64) -> Self {
        self.init_timeout_secs = secs;
        self
    }

    /// With custom prime code
    #[inline]
    #[must_use]
    pub fn with_prime_template(mut self, template: impl Into<String>) -> Self {
        self.prime_template = template.into();
        self
    }

    /// With a custom dataset variable name
    #[inline]
    #[must_use]
    pub fn with_frame_variable(mut self, name: impl Into<String>) -> Self {
        self.frame_variable = name.into();
        self
    }

    /// Idle timeout as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Sweep interval as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Prime budget as a [`Duration`]
    #[inline]
    #[must_use]
    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1_800,
            sweep_interval_secs: 60,
            init_timeout_secs: 60,
            prime_template: DEFAULT_PRIME_TEMPLATE.to_string(),
            frame_variable: "df".to_string(),
        }
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: watch::Sender<bool>,
}

/// One live session: its environment, history and run bookkeeping
pub struct SessionEntry {
    session_id: SessionId,
    dataset_ref: String,
    profile: DatasetProfile,
    snapshot_path: PathBuf,
    environment: Arc<dyn Environment>,
    created_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    history: Mutex<Vec<Exchange>>,
    run_lock: Arc<AsyncMutex<()>>,
    active_run: Mutex<Option<ActiveRun>>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("session_id", &self.session_id)
            .field("dataset_ref", &self.dataset_ref)
            .finish_non_exhaustive()
    }
}

impl SessionEntry {
    fn new(
        session_id: SessionId,
        dataset_ref: String,
        profile: DatasetProfile,
        snapshot_path: PathBuf,
        environment: Arc<dyn Environment>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            dataset_ref,
            profile,
            snapshot_path,
            environment,
            created_at: now,
            last_activity: Mutex::new(now),
            history: Mutex::new(Vec::new()),
            run_lock: Arc::new(AsyncMutex::new(())),
            active_run: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Active),
        }
    }

    /// Session identifier
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Dataset the session is bound to
    #[inline]
    #[must_use]
    pub fn dataset_ref(&self) -> &str {
        &self.dataset_ref
    }

    /// Structural profile of the bound dataset
    #[inline]
    #[must_use]
    pub fn profile(&self) -> &DatasetProfile {
        &self.profile
    }

    /// Where the session's snapshot lives
    #[inline]
    #[must_use]
    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// The session's live environment
    #[inline]
    #[must_use]
    pub fn environment(&self) -> Arc<dyn Environment> {
        Arc::clone(&self.environment)
    }

    /// When the session was opened
    #[inline]
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last touch
    #[inline]
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock()
    }

    /// Reset the idle clock, reviving an [`Lifecycle::Idle`] session
    pub fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Idle {
            *lifecycle = Lifecycle::Active;
        }
    }

    /// Snapshot of the session's exchanges, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Exchange> {
        self.history.lock().clone()
    }

    /// Where the session is in its life
    #[inline]
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    /// True once close has begun
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(
            self.lifecycle(),
            Lifecycle::Terminating | Lifecycle::Terminated
        )
    }

    fn mark_idle(&self) {
        let mut lifecycle = self.lifecycle.lock();
        if *lifecycle == Lifecycle::Active {
            *lifecycle = Lifecycle::Idle;
        }
    }

    /// Enter `Terminating`. False when close had already begun.
    fn begin_termination(&self) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Terminating | Lifecycle::Terminated => false,
            Lifecycle::Active | Lifecycle::Idle => {
                *lifecycle = Lifecycle::Terminating;
                true
            }
        }
    }

    /// Enter `Terminating` only while the session is still reapable.
    ///
    /// Rechecks the run slot and the idle clock under the lifecycle lock, so
    /// a run claimed since the reaper's scan keeps the session alive.
    fn begin_termination_if_expired(&self, now: DateTime<Utc>, cutoff: chrono::Duration) -> bool {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Terminating | Lifecycle::Terminated => false,
            Lifecycle::Active | Lifecycle::Idle => {
                if self.active_run.lock().is_some()
                    || now.signed_duration_since(*self.last_activity.lock()) <= cutoff
                {
                    return false;
                }
                *lifecycle = Lifecycle::Terminating;
                true
            }
        }
    }

    fn finish_termination(&self) {
        *self.lifecycle.lock() = Lifecycle::Terminated;
    }

    fn push_exchange(&self, exchange: Exchange) {
        self.history.lock().push(exchange);
    }
}

/// Exclusive permission to run against one session.
///
/// Holding the guard holds the session's run lock; dropping it releases the
/// lock and clears the active-run registration.
pub struct RunGuard {
    run_id: RunId,
    entry: Arc<SessionEntry>,
    cancel_rx: watch::Receiver<bool>,
    _permit: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl RunGuard {
    /// Identifier of this run
    #[inline]
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The session this run is bound to
    #[inline]
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.entry.session_id()
    }

    /// The session entry itself
    #[inline]
    #[must_use]
    pub fn entry(&self) -> &Arc<SessionEntry> {
        &self.entry
    }

    /// The session's live environment
    #[inline]
    #[must_use]
    pub fn environment(&self) -> Arc<dyn Environment> {
        self.entry.environment()
    }

    /// True once cancel or close has been requested
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// A receiver for select-style waiting on the cancel signal
    #[must_use]
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = self.entry.active_run.lock();
        if active.as_ref().is_some_and(|a| a.run_id == self.run_id) {
            *active = None;
        }
    }
}

/// Concurrent map of live sessions plus the seams they are built from
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    catalog: Arc<dyn DatasetCatalog>,
    snapshots: Arc<dyn SnapshotStore>,
    launcher: Arc<dyn EnvironmentLauncher>,
    config: SessionConfig,
}

impl SessionStore {
    /// Build a store over the given seams
    #[must_use]
    pub fn new(
        catalog: Arc<dyn DatasetCatalog>,
        snapshots: Arc<dyn SnapshotStore>,
        launcher: Arc<dyn EnvironmentLauncher>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            catalog,
            snapshots,
            launcher,
            config,
        }
    }

    /// Current configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Resolve or create a session bound to `dataset`.
    ///
    /// A known, live session id bound to the same dataset is reused and
    /// touched. A stale id, a closing session or a dataset mismatch all fall
    /// through to a fresh session with a new id; the caller learns the id
    /// from the returned entry.
    pub async fn open(
        &self,
        session_id: Option<SessionId>,
        dataset: &str,
    ) -> Result<Arc<SessionEntry>, SessionError> {
        if let Some(id) = session_id {
            if let Some(entry) = self.sessions.get(&id) {
                let entry = Arc::clone(entry.value());
                if !entry.is_closing() && entry.dataset_ref() == dataset {
                    entry.touch();
                    debug!(%id, dataset, "session reused");
                    return Ok(entry);
                }
            }
        }

        let id = SessionId::new();
        let payload = self.catalog.fetch(dataset).await?;

        let environment =
            self.launcher
                .launch()
                .await
                .map_err(|err| SessionError::Init {
                    reason: format!("launching environment: {err}"),
                })?;

        let snapshot_path = match self.snapshots.write(id, &payload.bytes).await {
            Ok(path) => path,
            Err(err) => {
                self.teardown_environment(id, &environment).await;
                return Err(err);
            }
        };

        let prime = self
            .config
            .prime_template
            .replace("{path}", &snapshot_path.display().to_string())
            .replace("{var}", &self.config.frame_variable);
        let primed = environment
            .execute(&prime, self.config.init_timeout())
            .await;
        let init_failure = match primed {
            Ok(output) if output.succeeded() => None,
            Ok(output) => Some(format!("prime failed: {}", output.stderr.trim())),
            Err(err) => Some(format!("prime failed: {err}")),
        };
        if let Some(reason) = init_failure {
            self.teardown_environment(id, &environment).await;
            if let Err(err) = self.snapshots.remove(id).await {
                warn!(%id, %err, "snapshot cleanup after failed init");
            }
            return Err(SessionError::Init { reason });
        }

        let entry = Arc::new(SessionEntry::new(
            id,
            dataset.to_string(),
            payload.profile,
            snapshot_path,
            environment,
        ));
        self.sessions.insert(id, Arc::clone(&entry));
        info!(session_id = %id, dataset, "session opened");
        Ok(entry)
    }

    /// Look up a live session
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<Arc<SessionEntry>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Reset a session's idle clock. Returns false for unknown sessions.
    pub fn touch(&self, session_id: SessionId) -> bool {
        match self.sessions.get(&session_id) {
            Some(entry) => {
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// List open sessions, most recently active last
    #[must_use]
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions
            .iter()
            .filter(|entry| !entry.value().is_closing())
            .map(|entry| {
                let e = entry.value();
                SessionInfo {
                    session_id: e.session_id(),
                    dataset_ref: e.dataset_ref().to_string(),
                    created_at: e.created_at(),
                    last_activity: e.last_activity(),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.last_activity);
        infos
    }

    /// Append a completed exchange to a session's history and touch it.
    /// Returns false for unknown sessions.
    pub fn record_exchange(&self, session_id: SessionId, query: &str, answer: &str) -> bool {
        match self.sessions.get(&session_id) {
            Some(entry) => {
                entry.push_exchange(Exchange {
                    query: query.to_string(),
                    answer: answer.to_string(),
                    asked_at: Utc::now(),
                });
                entry.touch();
                true
            }
            None => false,
        }
    }

    /// Claim the session's single run slot.
    ///
    /// Fails fast with [`SessionError::RunInProgress`] when another run holds
    /// the slot; never queues.
    pub fn begin_run(&self, session_id: SessionId) -> Result<RunGuard, SessionError> {
        let entry = self
            .get(session_id)
            .ok_or(SessionError::UnknownSession { session_id })?;
        if entry.is_closing() {
            return Err(SessionError::UnknownSession { session_id });
        }

        let permit = Arc::clone(&entry.run_lock)
            .try_lock_owned()
            .map_err(|_| SessionError::RunInProgress { session_id })?;

        let run_id = RunId::new();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            // Register under the lifecycle lock so the reaper's expiry
            // recheck and this claim cannot interleave.
            let lifecycle = entry.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Terminating | Lifecycle::Terminated) {
                return Err(SessionError::UnknownSession { session_id });
            }
            *entry.active_run.lock() = Some(ActiveRun {
                run_id,
                cancel: cancel_tx,
            });
        }
        entry.touch();
        debug!(%session_id, %run_id, "run slot claimed");

        Ok(RunGuard {
            run_id,
            entry,
            cancel_rx,
            _permit: permit,
        })
    }

    /// Ask the named run to stop at its next safe boundary.
    /// Returns false when the run is not active on that session.
    pub fn signal_cancel(&self, session_id: SessionId, run_id: RunId) -> bool {
        let Some(entry) = self.get(session_id) else {
            return false;
        };
        let active = entry.active_run.lock();
        match active.as_ref() {
            Some(a) if a.run_id == run_id => {
                let _ = a.cancel.send(true);
                info!(%session_id, %run_id, "cancel requested");
                true
            }
            _ => false,
        }
    }

    /// Close a session: cancel its run, wait for the run to release the
    /// slot, tear down the environment and delete the snapshot.
    ///
    /// Idempotent; closing an unknown or already-closing session returns
    /// without error.
    pub async fn close(&self, session_id: SessionId) -> Result<(), SessionError> {
        let Some(entry) = self.get(session_id) else {
            return Ok(());
        };
        if !entry.begin_termination() {
            return Ok(());
        }
        self.close_entry(&entry).await
    }

    /// Teardown after termination has been committed: cancel the active run,
    /// drain the run slot, release the environment and the snapshot.
    async fn close_entry(&self, entry: &Arc<SessionEntry>) -> Result<(), SessionError> {
        let session_id = entry.session_id();
        if let Some(active) = entry.active_run.lock().as_ref() {
            let _ = active.cancel.send(true);
        }

        // Wait for any active run to reach its next boundary and bail out.
        let _slot = Arc::clone(&entry.run_lock).lock_owned().await;

        self.sessions.remove(&session_id);
        self.teardown_environment(session_id, &entry.environment()).await;
        if let Err(err) = self.snapshots.remove(session_id).await {
            warn!(%session_id, %err, "snapshot removal during close");
        }
        entry.finish_termination();
        info!(%session_id, "session closed");
        Ok(())
    }

    /// Close every session idle past the configured timeout.
    /// Returns how many sessions were closed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.idle_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        let expired: Vec<Arc<SessionEntry>> = self
            .sessions
            .iter()
            .filter(|entry| {
                let e = entry.value();
                !e.is_closing()
                    && e.active_run.lock().is_none()
                    && now.signed_duration_since(e.last_activity()) > cutoff
            })
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut swept = 0;
        for entry in expired {
            entry.mark_idle();
            // A run claimed or a touch landed since the scan keeps the
            // session alive; the recheck commits atomically with the claim.
            if !entry.begin_termination_if_expired(now, cutoff) {
                continue;
            }
            let id = entry.session_id();
            match self.close_entry(&entry).await {
                Ok(()) => swept += 1,
                Err(err) => warn!(session_id = %id, %err, "reaper close failed"),
            }
        }
        swept
    }

    /// Spawn the background reaper task
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.sweep_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = store.sweep(Utc::now()).await;
                if swept > 0 {
                    debug!(swept, "idle sessions reaped");
                }
            }
        })
    }

    async fn teardown_environment(&self, session_id: SessionId, environment: &Arc<dyn Environment>) {
        if let Err(err) = environment.shutdown().await {
            warn!(%session_id, %err, "environment shutdown");
        }
    }
}

//! Per-session snapshot persistence.
//!
//! Every session gets exactly one snapshot, written at open and removed at
//! close. The store is write-once per session: a second write for the same
//! session is a bug upstream and is refused rather than silently clobbered.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::SessionError;
use crate::store::SessionId;

/// Durable home for session dataset snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist the snapshot for a session and return the path the
    /// environment can load it from. Refuses to overwrite.
    async fn write(&self, session_id: SessionId, bytes: &[u8]) -> Result<PathBuf, SessionError>;

    /// Remove a session's snapshot. Removing an absent snapshot is fine.
    async fn remove(&self, session_id: SessionId) -> Result<(), SessionError>;
}

/// Filesystem store: one `<root>/<session-id>.snapshot` file per session
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    /// Store rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_id: SessionId) -> PathBuf {
        self.root.join(format!("{session_id}.snapshot"))
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn write(&self, session_id: SessionId, bytes: &[u8]) -> Result<PathBuf, SessionError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|err| SessionError::Snapshot {
                reason: format!("creating {}: {err}", self.root.display()),
            })?;

        let path = self.path_for(session_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SessionError::Snapshot {
                reason: format!("snapshot already exists at {}", path.display()),
            });
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|err| SessionError::Snapshot {
                reason: format!("writing {}: {err}", path.display()),
            })?;

        debug!(%session_id, path = %path.display(), "snapshot written");
        Ok(path)
    }

    async fn remove(&self, session_id: SessionId) -> Result<(), SessionError> {
        let path = self.path_for(session_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%session_id, "snapshot removed");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SessionError::Snapshot {
                reason: format!("removing {}: {err}", path.display()),
            }),
        }
    }
}

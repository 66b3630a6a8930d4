//! Session store error types.

use datalyst_sandbox::SandboxError;

use crate::store::SessionId;

/// Errors surfaced by the session store
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session id is unknown or already closing
    #[error("unknown session {session_id}")]
    UnknownSession {
        /// The id that did not resolve
        session_id: SessionId,
    },

    /// The dataset reference did not resolve in the catalog
    #[error("dataset '{dataset}' not found")]
    DatasetNotFound {
        /// The reference that did not resolve
        dataset: String,
    },

    /// The catalog itself failed
    #[error("dataset catalog failed: {reason}")]
    Catalog {
        /// What went wrong
        reason: String,
    },

    /// The snapshot store failed
    #[error("snapshot store failed: {reason}")]
    Snapshot {
        /// What went wrong
        reason: String,
    },

    /// Environment launch or priming failed during open
    #[error("session init failed: {reason}")]
    Init {
        /// What went wrong
        reason: String,
    },

    /// The session already has an active run
    #[error("a run is already active for session {session_id}")]
    RunInProgress {
        /// The busy session
        session_id: SessionId,
    },

    /// Sandbox failure outside the init path
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl SessionError {
    /// True when the caller raced an active run and should retry later
    #[must_use]
    pub fn is_run_in_progress(&self) -> bool {
        matches!(self, Self::RunInProgress { .. })
    }

    /// True when the request named something that does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UnknownSession { .. } | Self::DatasetNotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates_classify_variants() {
        let busy = SessionError::RunInProgress {
            session_id: SessionId::new(),
        };
        assert!(busy.is_run_in_progress());
        assert!(!busy.is_not_found());

        let missing = SessionError::DatasetNotFound {
            dataset: "absent".to_string(),
        };
        assert!(missing.is_not_found());
    }
}

//! Session lifecycle for the analysis workflow.
//!
//! A session binds one dataset snapshot to one live interpreter environment
//! and accumulates conversation history against it. This crate provides:
//!
//! - [`SessionStore`]: concurrent open/reuse/close with per-session state
//! - [`RunGuard`]: the one-run-per-session exclusivity claim
//! - [`DatasetCatalog`] and [`SnapshotStore`] seams with filesystem impls
//! - A background reaper that closes idle sessions
//!
//! # Example
//!
//! ```rust,ignore
//! use datalyst_session::{SessionConfig, SessionStore};
//!
//! let store = SessionStore::new(catalog, snapshots, launcher, SessionConfig::default());
//! let entry = store.open(None, "fleet-2024").await?;
//! let guard = store.begin_run(entry.session_id())?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod dataset;
pub mod error;
pub mod snapshot;
pub mod store;

pub use dataset::{ColumnProfile, DatasetCatalog, DatasetPayload, DatasetProfile, FsDatasetCatalog};
pub use error::SessionError;
pub use snapshot::{FsSnapshotStore, SnapshotStore};
pub use store::{
    Exchange, Lifecycle, RunGuard, SessionConfig, SessionEntry, SessionId, SessionInfo,
    SessionStore, DEFAULT_PRIME_TEMPLATE,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Agentic dataset-analysis workflow engine.
//!
//! Answers natural-language questions about tabular datasets by walking a
//! fixed workflow per run:
//!
//! - **Plan**: break the question into ordered steps
//! - **Execute**: generate and run code per step in the session's sandbox
//! - **Recover**: diagnose failures and retry within a bounded budget
//! - **Chart**: attempt one visualization of the final result
//! - **Respond**: synthesize the closing answer
//!
//! Sessions are isolated and stateful; every run streams an ordered,
//! replayable event trace through the [`datalyst_stream`] hub.
//!
//! # Example
//!
//! ```rust,ignore
//! use datalyst_engine::{EngineConfig, Orchestrator, QueryRequest};
//! use futures::StreamExt;
//!
//! datalyst_engine::telemetry::init();
//! let engine = Orchestrator::with_process_sandbox(backend, catalog, snapshots, EngineConfig::new());
//! engine.spawn_reaper();
//!
//! let accepted = engine
//!     .submit(QueryRequest::new("fleet-2024", "average fuel use per driver"))
//!     .await?;
//! let mut events = engine.subscribe(accepted.run_id).await?;
//! while let Some(event) = events.next().await {
//!     println!("{}", serde_json::to_string(&*event)?);
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
mod driver;
pub mod error;
pub mod facade;
pub mod machine;
pub mod telemetry;

pub use config::{EngineConfig, StreamSettings};
pub use error::EngineError;
pub use facade::{Orchestrator, QueryAccepted, QueryRequest};
pub use machine::{advance, Phase, RetryPolicy, RetryScope, Signal, TransitionError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Datalyst Stream - ordered run traces, replay and fan-out
//!
//! The streaming layer that exposes a run's reasoning trace:
//! - Wire-level event model (`{type, payload, timestamp, step_index?}`)
//! - Hash-chained per-run log, the canonical replayable history
//! - Multiplexer fanning events out to any number of subscribers
//! - Late subscribers replay the full buffer before the live feed
//! - Closed buffers linger for a grace period, then expire
//!
//! # Example
//!
//! ```rust,ignore
//! use datalyst_stream::{Event, EventHub, RunId, StreamConfig};
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = EventHub::new(&StreamConfig::default());
//! let run_id = RunId::new();
//!
//! hub.open_run(run_id)?;
//! hub.publish(run_id, Event::log("starting analysis"))?;
//!
//! let mut stream = hub.subscribe(run_id).await?;
//! while let Some(event) = stream.next().await {
//!     println!("{}", event.kind);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod events;
pub mod hub;
pub mod log;

// Re-exports for convenience
pub use error::StreamError;
pub use events::{Event, EventKind, RunId};
pub use hub::{EventHub, EventStream, StreamConfig};
pub use log::{EventRecord, RunLog};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

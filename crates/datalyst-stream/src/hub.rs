//! Event Stream Multiplexer: ordered fan-out with full replay.
//!
//! One [`EventHub`] serves every run in the process. Live runs keep their
//! [`RunLog`] and subscriber list behind a single per-run lock, so a
//! subscriber registers atomically with respect to `publish` and sees every
//! event exactly once, in emission order, no matter how late it attaches.
//! Completed runs move into an idle-expiring cache; subscribing to one
//! replays the full buffer and ends the stream instead of blocking.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::StreamError;
use crate::events::{Event, RunId};
use crate::log::RunLog;

/// Multiplexer tuning
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How long a closed run's buffer is kept after its last subscriber
    pub retention: Duration,
    /// Upper bound on retained closed runs
    pub max_closed_runs: u64,
}

impl StreamConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a custom closed-run retention grace period
    #[inline]
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// With a custom closed-run capacity
    #[inline]
    #[must_use]
    pub fn with_max_closed_runs(mut self, max: u64) -> Self {
        self.max_closed_runs = max;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            max_closed_runs: 1024,
        }
    }
}

struct LiveState {
    log: RunLog,
    subscribers: Vec<mpsc::UnboundedSender<Arc<Event>>>,
    closed: bool,
}

/// Fan-out hub for run event streams
pub struct EventHub {
    live: DashMap<RunId, Arc<Mutex<LiveState>>>,
    closed: moka::future::Cache<RunId, Arc<RunLog>>,
}

impl EventHub {
    /// Build a hub with the given retention policy
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        let closed = moka::future::Cache::builder()
            .max_capacity(config.max_closed_runs)
            .time_to_idle(config.retention)
            .build();
        Self {
            live: DashMap::new(),
            closed,
        }
    }

    /// Allocate the ordered buffer for a new run
    pub fn open_run(&self, run_id: RunId) -> Result<(), StreamError> {
        if self.live.contains_key(&run_id) || self.closed.contains_key(&run_id) {
            return Err(StreamError::AlreadyOpen(run_id));
        }
        self.live.insert(
            run_id,
            Arc::new(Mutex::new(LiveState {
                log: RunLog::new(run_id),
                subscribers: Vec::new(),
                closed: false,
            })),
        );
        debug!(run_id = %run_id, "run stream opened");
        Ok(())
    }

    /// Append an event to the run's buffer and forward it to subscribers
    pub fn publish(&self, run_id: RunId, event: Event) -> Result<(), StreamError> {
        let state = self
            .live
            .get(&run_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StreamError::UnknownRun(run_id))?;

        let mut state = state.lock();
        if state.closed {
            return Err(StreamError::RunClosed(run_id));
        }
        let event = state.log.append(event)?;
        // A dead receiver is not an error; the log stays source of truth.
        state
            .subscribers
            .retain(|tx| tx.send(Arc::clone(&event)).is_ok());
        Ok(())
    }

    /// Replay the run's history, then follow live events until the run closes
    pub async fn subscribe(&self, run_id: RunId) -> Result<EventStream, StreamError> {
        if let Some(state) = self.live.get(&run_id).map(|entry| Arc::clone(entry.value())) {
            let mut state = state.lock();
            let backlog: VecDeque<Arc<Event>> = state.log.events().into();
            if state.closed {
                return Ok(EventStream::replay_only(backlog));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.push(tx);
            return Ok(EventStream::with_live(backlog, rx));
        }

        match self.closed.get(&run_id).await {
            Some(log) => Ok(EventStream::replay_only(log.events().into())),
            None => Err(StreamError::UnknownRun(run_id)),
        }
    }

    /// Close the run's buffer after its terminal event
    ///
    /// Attached subscribers drain whatever is pending and then end; the
    /// buffer stays replayable until no subscriber has attached for the
    /// retention grace period. Idempotent for already-closed runs.
    pub async fn complete(&self, run_id: RunId) -> Result<(), StreamError> {
        let Some(state) = self.live.get(&run_id).map(|entry| Arc::clone(entry.value())) else {
            if self.closed.contains_key(&run_id) {
                return Ok(());
            }
            return Err(StreamError::UnknownRun(run_id));
        };

        let log = {
            let mut state = state.lock();
            state.closed = true;
            state.subscribers.clear();
            state.log.clone()
        };
        let events = log.len();
        // The closed buffer goes in before the live entry comes out, so a
        // subscriber racing this handoff always resolves the run from one
        // map or the other.
        self.closed.insert(run_id, Arc::new(log)).await;
        self.live.remove(&run_id);
        debug!(run_id = %run_id, events, "run stream completed");
        Ok(())
    }

    /// Recompute the hash chain over the run's buffer
    pub async fn verify_integrity(&self, run_id: RunId) -> Result<(), StreamError> {
        if let Some(state) = self.live.get(&run_id).map(|entry| Arc::clone(entry.value())) {
            return state.lock().log.verify_integrity();
        }
        match self.closed.get(&run_id).await {
            Some(log) => log.verify_integrity(),
            None => Err(StreamError::UnknownRun(run_id)),
        }
    }

    /// Number of runs currently streaming
    #[must_use]
    pub fn live_runs(&self) -> usize {
        self.live.len()
    }
}

/// Ordered event sequence: buffered replay first, then the live feed
pub struct EventStream {
    backlog: VecDeque<Arc<Event>>,
    live: Option<mpsc::UnboundedReceiver<Arc<Event>>>,
}

impl EventStream {
    fn replay_only(backlog: VecDeque<Arc<Event>>) -> Self {
        Self {
            backlog,
            live: None,
        }
    }

    fn with_live(backlog: VecDeque<Arc<Event>>, rx: mpsc::UnboundedReceiver<Arc<Event>>) -> Self {
        Self {
            backlog,
            live: Some(rx),
        }
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(event) = this.backlog.pop_front() {
            return Poll::Ready(Some(event));
        }
        match this.live.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn publish_without_subscribers_is_ok() {
        tokio_test::block_on(async {
            let hub = EventHub::new(&StreamConfig::default());
            let run_id = RunId::new();

            hub.open_run(run_id).unwrap();
            hub.publish(run_id, Event::log("no one is listening")).unwrap();
            assert_eq!(hub.live_runs(), 1);
        });
    }

    #[test]
    fn double_open_is_rejected() {
        let hub = EventHub::new(&StreamConfig::default());
        let run_id = RunId::new();

        hub.open_run(run_id).unwrap();
        assert!(matches!(
            hub.open_run(run_id),
            Err(StreamError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn publish_to_unknown_run_fails() {
        let hub = EventHub::new(&StreamConfig::default());
        assert!(matches!(
            hub.publish(RunId::new(), Event::log("nope")),
            Err(StreamError::UnknownRun(_))
        ));
    }

    #[test]
    fn publish_after_complete_is_rejected() {
        tokio_test::block_on(async {
            let hub = EventHub::new(&StreamConfig::default());
            let run_id = RunId::new();

            hub.open_run(run_id).unwrap();
            hub.publish(run_id, Event::final_response("done")).unwrap();
            hub.complete(run_id).await.unwrap();

            assert!(hub.publish(run_id, Event::log("late")).is_err());
            // Completing again is harmless.
            hub.complete(run_id).await.unwrap();
        });
    }

    #[test]
    fn live_subscriber_sees_backlog_then_live_events() {
        tokio_test::block_on(async {
            let hub = EventHub::new(&StreamConfig::default());
            let run_id = RunId::new();
            hub.open_run(run_id).unwrap();

            hub.publish(run_id, Event::log("one")).unwrap();
            hub.publish(run_id, Event::log("two")).unwrap();

            let stream = hub.subscribe(run_id).await.unwrap();

            hub.publish(run_id, Event::final_response("three")).unwrap();
            hub.complete(run_id).await.unwrap();

            let seen: Vec<_> = stream.collect().await;
            assert_eq!(seen.len(), 3);
            assert!(seen[2].is_terminal());
        });
    }

    #[test]
    fn subscribing_to_an_unknown_run_fails() {
        tokio_test::block_on(async {
            let hub = EventHub::new(&StreamConfig::default());
            assert!(matches!(
                hub.subscribe(RunId::new()).await,
                Err(StreamError::UnknownRun(_))
            ));
        });
    }
}

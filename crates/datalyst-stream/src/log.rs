//! Ordered, hash-chained log of one run's events.
//!
//! The log is the canonical history replayed to late subscribers. Each
//! appended event is sequence-numbered and chained with SHA-256 over the
//! previous hash, the sequence and the event's canonical JSON, so tampering
//! or reordering is detectable after the fact. Chain fields stay internal;
//! only the [`Event`] itself goes on the wire.
//!
//! `RunLog` is not synchronized; the hub wraps it in a per-run lock.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::StreamError;
use crate::events::{Event, RunId};

/// One chained log entry
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Zero-based position in the run's history
    pub seq: u64,
    /// The wire-visible event
    pub event: Arc<Event>,
    /// Hash of the previous record (zero for the first)
    pub prev_hash: [u8; 32],
    /// Hash over `prev_hash`, `seq` and the event's canonical JSON
    pub hash: [u8; 32],
}

/// Append-only event history for a single run
#[derive(Debug, Clone)]
pub struct RunLog {
    run_id: RunId,
    records: Vec<EventRecord>,
}

impl RunLog {
    /// Empty log for a run
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            records: Vec::new(),
        }
    }

    /// The run this log belongs to
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Append an event, extending the hash chain
    pub fn append(&mut self, event: Event) -> Result<Arc<Event>, StreamError> {
        let seq = self.records.len() as u64;
        let prev_hash = self.records.last().map(|r| r.hash).unwrap_or([0u8; 32]);
        let event = Arc::new(event);
        let hash = compute_hash(seq, &event, &prev_hash)?;
        self.records.push(EventRecord {
            seq,
            event: Arc::clone(&event),
            prev_hash,
            hash,
        });
        Ok(event)
    }

    /// Events in emission order
    #[must_use]
    pub fn events(&self) -> Vec<Arc<Event>> {
        self.records.iter().map(|r| Arc::clone(&r.event)).collect()
    }

    /// Chained records in emission order
    #[must_use]
    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    /// Number of events logged so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing has been logged yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Walk the chain and recompute every hash
    pub fn verify_integrity(&self) -> Result<(), StreamError> {
        let mut prev = [0u8; 32];
        for record in &self.records {
            if record.prev_hash != prev {
                return Err(StreamError::IntegrityViolation { seq: record.seq });
            }
            let expected = compute_hash(record.seq, &record.event, &record.prev_hash)?;
            if record.hash != expected {
                return Err(StreamError::IntegrityViolation { seq: record.seq });
            }
            prev = record.hash;
        }
        Ok(())
    }
}

fn compute_hash(seq: u64, event: &Event, prev_hash: &[u8; 32]) -> Result<[u8; 32], StreamError> {
    let body = serde_json::to_vec(event)?;
    let mut hasher = Sha256::new();
    hasher.update(prev_hash);
    hasher.update(seq.to_le_bytes());
    hasher.update(&body);
    Ok(hasher.finalize().into())
}

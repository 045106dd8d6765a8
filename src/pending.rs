//! In-memory queue of decisions awaiting manual approval.
//!
//! Keyed by `kill_id`. Entries leave the queue when approved over HTTP or
//! when their review window expires. Deliberately not durable: after a
//! crash, stream redelivery reconstructs pending state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::models::{Decision, KillReport};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub report: KillReport,
    pub decision: Decision,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClaimError {
    /// No pending entry for this kill.
    NotPending,
    /// An approval for this kill is already executing.
    InFlight,
}

#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

struct Inner {
    entries: HashMap<String, PendingEntry>,
    in_flight: HashSet<String>,
}

pub struct PendingQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a decision for review. Fails when the queue is at capacity so
    /// the caller can downgrade to a denial.
    pub fn insert(&self, report: KillReport, decision: Decision) -> Result<(), QueueFull> {
        let mut inner = self.inner.lock();
        if inner.entries.len() >= self.capacity {
            return Err(QueueFull);
        }
        let expires_at = Utc::now() + Duration::minutes(decision.timeout_minutes);
        let kill_id = report.kill_id.clone();
        inner.entries.insert(
            kill_id,
            PendingEntry {
                report,
                decision,
                expires_at,
            },
        );
        Ok(())
    }

    /// Take an entry for approval, marking the kill in flight until
    /// `complete` is called. A concurrent second approval sees `InFlight`.
    pub fn claim(&self, kill_id: &str) -> Result<PendingEntry, ClaimError> {
        let mut inner = self.inner.lock();
        if inner.in_flight.contains(kill_id) {
            return Err(ClaimError::InFlight);
        }
        match inner.entries.remove(kill_id) {
            Some(entry) => {
                inner.in_flight.insert(kill_id.to_string());
                Ok(entry)
            }
            None => Err(ClaimError::NotPending),
        }
    }

    /// Finish an approval started with `claim`.
    pub fn complete(&self, kill_id: &str) {
        self.inner.lock().in_flight.remove(kill_id);
    }

    /// Remove and return entries whose review window has passed. Entries
    /// claimed for approval are no longer in the map and cannot expire.
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<PendingEntry> {
        let mut inner = self.inner.lock();
        let expired_keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(kill_id, _)| kill_id.clone())
            .collect();

        expired_keys
            .into_iter()
            .filter_map(|kill_id| inner.entries.remove(&kill_id))
            .collect()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

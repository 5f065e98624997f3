//! Per-service circuit records.
//!
//! The store is an owned handle rather than a global table: every
//! [`crate::CircuitBreaker`] gets one, and tests build as many as they need.

use crate::circuit_breaker::{CircuitSnapshot, CircuitState};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// State-machine record for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitRecord {
    /// Current state.
    pub status: CircuitState,
    /// Consecutive counted failures.
    pub failure_count: usize,
    /// Consecutive successes while half-open.
    pub success_count: usize,
    /// Clock millis of the last counted failure.
    pub last_failure_time: Option<u64>,
    /// Clock millis of the last state change.
    pub state_changed_at: u64,
    /// Trial calls currently in flight while half-open.
    pub half_open_requests: usize,
    /// Bumped on every state change.
    pub generation: u64,
}

impl CircuitRecord {
    /// A closed circuit created at `now`.
    pub fn new(now: u64) -> Self {
        Self {
            status: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            state_changed_at: now,
            half_open_requests: 0,
            generation: 0,
        }
    }

    /// Move to `status`, returning the previous state.
    ///
    /// Entering any state clears the success streak and the trial slots;
    /// entering `Closed` also clears the failure streak.
    pub(crate) fn enter(&mut self, status: CircuitState, now: u64) -> CircuitState {
        let previous = self.status;
        self.status = status;
        self.state_changed_at = now;
        self.success_count = 0;
        self.half_open_requests = 0;
        self.generation = self.generation.wrapping_add(1);
        if status == CircuitState::Closed {
            self.failure_count = 0;
        }
        previous
    }

    /// Read-only copy for callers.
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            status: self.status,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
            state_changed_at: self.state_changed_at,
            half_open_requests: self.half_open_requests,
        }
    }
}

/// Owned, cloneable handle to the circuit table.
///
/// Clones share the same table; every read and write goes through one mutex.
#[derive(Debug, Clone, Default)]
pub struct CircuitStore {
    inner: Arc<Mutex<HashMap<String, CircuitRecord>>>,
}

impl CircuitStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the table, recovering from poisoning. Records are plain data, so a
    /// panic elsewhere cannot leave one half-written.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, CircuitRecord>> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!(target: "geoguard::circuit_breaker", "circuit store lock was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Copy of one record.
    pub fn get(&self, service: &str) -> Option<CircuitRecord> {
        self.lock().get(service).cloned()
    }

    /// Insert or replace a record, overwriting any existing one.
    pub fn insert(&self, service: impl Into<String>, record: CircuitRecord) -> Option<CircuitRecord> {
        let service = service.into();
        let mut table = self.lock();
        if table.contains_key(&service) {
            warn!(target: "geoguard::circuit_breaker", service = %service, "circuit record replaced");
        }
        table.insert(service, record)
    }

    /// Remove a record.
    pub fn remove(&self, service: &str) -> Option<CircuitRecord> {
        self.lock().remove(service)
    }

    /// Remove every record, returning them.
    pub fn drain(&self) -> Vec<(String, CircuitRecord)> {
        self.lock().drain().collect()
    }

    /// Number of tracked services.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no service is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot of every record, sorted by service name.
    pub fn snapshot(&self) -> Vec<(String, CircuitSnapshot)> {
        let table = self.lock();
        let mut entries: Vec<(String, CircuitSnapshot)> =
            table.iter().map(|(k, v)| (k.clone(), v.snapshot())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

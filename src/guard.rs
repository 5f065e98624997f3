//! Rate limiter and circuit breaker, sequenced for one upstream provider.
//!
//! [`ApiGuard`] asks the limiter first; only admitted calls reach the
//! breaker. The two never share state: the guard holds a handle to each and
//! does the sequencing without storing anything itself.
//!
//! ```rust
//! use geoguard::{ApiError, ApiGuard, GuardConfig, GuardOutcome};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let guard = ApiGuard::new(GuardConfig::geocoding());
//! let outcome = guard
//!     .execute("geocode", "api-key-1", || async {
//!         Ok::<_, ApiError>("San Juan, PR")
//!     })
//!     .await;
//! assert!(matches!(outcome, GuardOutcome::Completed(ref call) if call.is_ok()));
//! # }
//! ```

use crate::circuit_breaker::{
    CallOutcome, CircuitBreaker, CircuitSnapshot, CircuitState, CircuitStore,
};
use crate::classify::Classify;
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::{CallError, ResilienceError, SchedulerError};
use crate::rate_limit::{Admission, BucketStore, RateLimiter, Window};
use crate::scheduler::{Scheduler, TickHandle};
use crate::telemetry::{emit_best_effort, CallEvent, CallResult, GuardEvent, NullSink, TelemetrySink};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of [`ApiGuard::execute`].
#[derive(Debug)]
pub enum GuardOutcome<T, E> {
    /// The limiter did not admit the call; nothing ran.
    Limited {
        /// Whole seconds until a token is available.
        retry_after_secs: u64,
        /// The window that denied admission.
        window: Window,
    },
    /// The call went through the breaker.
    Completed(CallOutcome<T, E>),
}

impl<T, E> GuardOutcome<T, E> {
    /// True when the rate limiter turned the call away.
    pub fn is_limited(&self) -> bool {
        matches!(self, GuardOutcome::Limited { .. })
    }

    /// Retry hint when limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GuardOutcome::Limited { retry_after_secs, .. } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            GuardOutcome::Completed(_) => None,
        }
    }

    /// The breaker's outcome, if the call was admitted.
    pub fn completed(self) -> Option<CallOutcome<T, E>> {
        match self {
            GuardOutcome::Completed(outcome) => Some(outcome),
            GuardOutcome::Limited { .. } => None,
        }
    }

    /// Collapse to a `Result`; a fallback value counts as success.
    pub fn into_result(self) -> Result<T, ResilienceError<CallError<E>>> {
        match self {
            GuardOutcome::Limited { retry_after_secs, window } => {
                Err(ResilienceError::RateLimited { retry_after_secs, window })
            }
            GuardOutcome::Completed(outcome) => outcome.into_result().map_err(ResilienceError::Inner),
        }
    }
}

/// Handles for the two background sweeps. Dropping them stops the sweeps.
#[derive(Debug)]
pub struct SweepHandles {
    /// Rate-limit refill sweep.
    pub refill: TickHandle,
    /// Circuit recovery sweep.
    pub recovery: TickHandle,
}

/// Point-in-time view of a guard.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthReport {
    /// Every tracked circuit, sorted by service name.
    pub circuits: Vec<(String, CircuitSnapshot)>,
    /// Circuits currently open.
    pub open_circuits: usize,
    /// Circuits currently half-open.
    pub half_open_circuits: usize,
    /// Token buckets currently tracked (four per endpoint/identifier pair).
    pub tracked_buckets: usize,
}

impl HealthReport {
    /// True when every circuit is closed.
    pub fn is_healthy(&self) -> bool {
        self.open_circuits == 0 && self.half_open_circuits == 0
    }
}

/// Rate limiter plus circuit breaker for one upstream provider.
///
/// Clones share both stores.
#[derive(Debug, Clone)]
pub struct ApiGuard<S = NullSink> {
    limiter: RateLimiter,
    breaker: CircuitBreaker<S>,
    config: Arc<GuardConfig>,
    sink: S,
}

impl ApiGuard<NullSink> {
    /// Guard with fresh stores, the monotonic clock and no telemetry.
    pub fn new(config: GuardConfig) -> Self {
        Self {
            limiter: RateLimiter::new(*config.limits()),
            breaker: CircuitBreaker::new(config.breaker().clone()),
            config: Arc::new(config),
            sink: NullSink,
        }
    }
}

impl<S> ApiGuard<S> {
    /// Drive both subsystems from `clock`.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.limiter = self.limiter.with_shared_clock(clock.clone());
        self.breaker = self.breaker.with_shared_clock(clock);
        self
    }

    /// Use existing stores, e.g. to share state with another guard.
    pub fn with_stores(mut self, buckets: BucketStore, circuits: CircuitStore) -> Self {
        self.limiter = self.limiter.with_store(buckets);
        self.breaker = self.breaker.with_store(circuits);
        self
    }

    /// Send every call and transition event to `sink`.
    pub fn with_sink<T: Clone>(self, sink: T) -> ApiGuard<T> {
        ApiGuard {
            limiter: self.limiter,
            breaker: self.breaker.with_sink(sink.clone()),
            config: self.config,
            sink,
        }
    }

    /// The rate limiter consulted first.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The breaker admitted calls run under.
    pub fn breaker(&self) -> &CircuitBreaker<S> {
        &self.breaker
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Snapshot of every circuit plus the bucket count.
    pub fn health(&self) -> HealthReport {
        let circuits = self.breaker.snapshot_all();
        let count = |state: CircuitState| circuits.iter().filter(|(_, snap)| snap.status == state).count();
        HealthReport {
            open_circuits: count(CircuitState::Open),
            half_open_circuits: count(CircuitState::HalfOpen),
            tracked_buckets: self.limiter.tracked_buckets(),
            circuits,
        }
    }
}

impl<S> ApiGuard<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Admit the call against `endpoint`'s quota for `identifier`, then run it
    /// under the circuit for `endpoint`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        endpoint: &str,
        identifier: &str,
        operation: F,
    ) -> GuardOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        if let Some(limited) = self.admit(endpoint, identifier).await {
            return limited;
        }
        GuardOutcome::Completed(self.breaker.call(endpoint, operation).await)
    }

    /// Like [`execute`](Self::execute), with a fallback for calls the breaker
    /// turns away or that fail. A rate-limited call does not run the fallback;
    /// the caller gets the retry hint instead.
    pub async fn execute_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        endpoint: &str,
        identifier: &str,
        operation: F,
        fallback: FB,
    ) -> GuardOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(&CallError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        if let Some(limited) = self.admit(endpoint, identifier).await {
            return limited;
        }
        GuardOutcome::Completed(self.breaker.call_with_fallback(endpoint, operation, fallback).await)
    }

    async fn admit<T, E>(&self, endpoint: &str, identifier: &str) -> Option<GuardOutcome<T, E>> {
        match self.limiter.check_and_consume(endpoint, identifier) {
            Admission::Allowed { .. } => None,
            Admission::Limited { retry_after_secs, window } => {
                debug!(endpoint, identifier, %window, retry_after_secs, "call not admitted");
                let event = GuardEvent::Call(CallEvent {
                    service: endpoint.to_owned(),
                    result: CallResult::RateLimited { window },
                    duration: Duration::ZERO,
                });
                emit_best_effort(self.sink.clone(), event).await;
                Some(GuardOutcome::Limited { retry_after_secs, window })
            }
        }
    }

    /// Register the refill and recovery sweeps at the configured intervals.
    pub fn start(&self, scheduler: &dyn Scheduler) -> Result<SweepHandles, SchedulerError>
    where
        S: Sync,
    {
        let ticks = self.config.ticks();
        let refill = self.limiter.start(scheduler, ticks.refill())?;
        let recovery = self.breaker.start(scheduler, ticks.recovery())?;
        Ok(SweepHandles { refill, recovery })
    }
}

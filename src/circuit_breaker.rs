//! Per-service circuit breaker with classified failures and timed recovery.
//!
//! Each service name gets its own circuit. A circuit opens after
//! `failure_threshold` consecutive *counted* failures, stays open until a
//! [`CircuitBreaker::sweep`] finds that `recovery_timeout` has elapsed, then
//! lets a bounded number of trial calls through while half-open. Which
//! errors count is decided by the config's [`FailurePolicy`].
//!
//! Calls never move a circuit from Open to HalfOpen; only the sweep does.
//! Production code registers the sweep with [`CircuitBreaker::start`].

mod store;

pub use store::{CircuitRecord, CircuitStore};

use crate::classify::{Classification, Classify, FailurePolicy};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{CallError, ConfigError, SchedulerError};
use crate::scheduler::{Scheduler, TickHandle};
use crate::telemetry::{
    emit_best_effort, CallEvent, CallResult, GuardEvent, NullSink, Rejection, TelemetrySink,
    TransitionEvent, TransitionReason,
};
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Current state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(rename_all = "snake_case"))]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected until the recovery sweep moves the circuit on.
    Open,
    /// A limited number of trial calls test whether the service recovered.
    HalfOpen,
}

impl CircuitState {
    /// Lowercase name used in logs and serialized output.
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only view of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CircuitSnapshot {
    /// Current state.
    pub status: CircuitState,
    /// Consecutive counted failures; reset when the circuit closes.
    pub failure_count: usize,
    /// Successful trial calls in the current half-open window.
    pub success_count: usize,
    /// Clock millis of the last counted failure, if any.
    pub last_failure_time: Option<u64>,
    /// Clock millis of the last state change.
    pub state_changed_at: u64,
    /// Trial calls in flight while half-open.
    pub half_open_requests: usize,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    recovery_timeout: Duration,
    success_threshold: usize,
    max_half_open_requests: usize,
    policy: FailurePolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 3,
            max_half_open_requests: 3,
            policy: FailurePolicy::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config with the default [`FailurePolicy`], validating every value.
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
        success_threshold: usize,
        max_half_open_requests: usize,
    ) -> Result<Self, ConfigError> {
        Self::builder()
            .failure_threshold(failure_threshold)
            .recovery_timeout(recovery_timeout)
            .success_threshold(success_threshold)
            .max_half_open_requests(max_half_open_requests)
            .build()
    }

    /// Builder starting from the defaults (5 failures, 30s, 3 successes, 3 trials).
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder { config: Self::default() }
    }

    /// Consecutive counted failures before a closed circuit opens.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Time an open circuit waits before the sweep moves it to half-open.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Successes needed while half-open to close.
    pub fn success_threshold(&self) -> usize {
        self.success_threshold
    }

    /// Trial calls allowed in flight while half-open.
    pub fn max_half_open_requests(&self) -> usize {
        self.max_half_open_requests
    }

    /// Which errors count toward `failure_threshold`.
    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::ZeroFailureThreshold);
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::ZeroSuccessThreshold);
        }
        if self.max_half_open_requests == 0 {
            return Err(ConfigError::ZeroHalfOpenLimit);
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::ZeroRecoveryTimeout);
        }
        Ok(())
    }

    fn recovery_millis(&self) -> u64 {
        u64::try_from(self.recovery_timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Builder for [`CircuitBreakerConfig`]; values are checked in [`build`](Self::build).
///
/// ```rust
/// use geoguard::{CircuitBreakerConfig, ConfigError};
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::builder()
///     .failure_threshold(3)
///     .recovery_timeout(Duration::from_secs(60))
///     .max_half_open_requests(1)
///     .build()
///     .unwrap();
/// assert_eq!(config.failure_threshold(), 3);
/// assert_eq!(config.success_threshold(), 3);
///
/// let err = CircuitBreakerConfig::builder().success_threshold(0).build().unwrap_err();
/// assert_eq!(err, ConfigError::ZeroSuccessThreshold);
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Consecutive counted failures before the circuit opens. Must be non-zero.
    pub fn failure_threshold(mut self, n: usize) -> Self {
        self.config.failure_threshold = n;
        self
    }

    /// How long the circuit stays open before a sweep may half-open it. Must be non-zero.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.recovery_timeout = timeout;
        self
    }

    /// Trial successes needed to close a half-open circuit. Must be non-zero.
    pub fn success_threshold(mut self, n: usize) -> Self {
        self.config.success_threshold = n;
        self
    }

    /// Trial calls allowed in flight at once while half-open. Must be non-zero.
    pub fn max_half_open_requests(mut self, n: usize) -> Self {
        self.config.max_half_open_requests = n;
        self
    }

    /// Replace the default [`FailurePolicy`].
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Validate and return the config; the first zero value is reported.
    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Result of a guarded call.
#[derive(Debug)]
pub enum CallOutcome<T, E> {
    /// The primary call succeeded.
    Ok(T),
    /// The primary call did not produce a value; the fallback did.
    Fallback {
        /// Why the fallback ran.
        reason: CallError<E>,
        /// The fallback's value.
        value: T,
    },
    /// No value was produced.
    Err(CallError<E>),
}

impl<T, E> CallOutcome<T, E> {
    /// True when the primary call succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok(_))
    }

    /// True when the fallback produced the value.
    pub fn is_fallback(&self) -> bool {
        matches!(self, CallOutcome::Fallback { .. })
    }

    /// The value from either the primary call or the fallback.
    pub fn value(&self) -> Option<&T> {
        match self {
            CallOutcome::Ok(value) | CallOutcome::Fallback { value, .. } => Some(value),
            CallOutcome::Err(_) => None,
        }
    }

    /// Owned form of [`value`](Self::value).
    pub fn into_value(self) -> Option<T> {
        match self {
            CallOutcome::Ok(value) | CallOutcome::Fallback { value, .. } => Some(value),
            CallOutcome::Err(_) => None,
        }
    }

    /// Why the primary call did not produce the value, if it did not.
    pub fn reason(&self) -> Option<&CallError<E>> {
        match self {
            CallOutcome::Ok(_) => None,
            CallOutcome::Fallback { reason, .. } | CallOutcome::Err(reason) => Some(reason),
        }
    }

    /// Collapse to a `Result`, treating a fallback value as success.
    pub fn into_result(self) -> Result<T, CallError<E>> {
        match self {
            CallOutcome::Ok(value) | CallOutcome::Fallback { value, .. } => Ok(value),
            CallOutcome::Err(err) => Err(err),
        }
    }
}

/// Whether a call may proceed.
enum Gate {
    /// Admitted under the record's `generation`; trial calls also hold a slot.
    Pass { generation: u64, slot: Option<TrialSlot> },
    Open { open_for: Duration },
    HalfOpenFull,
}

/// Holds one half-open trial slot; releasing it on drop covers success,
/// failure, panic and cancellation alike.
struct TrialSlot {
    store: CircuitStore,
    service: String,
    generation: u64,
}

impl Drop for TrialSlot {
    fn drop(&mut self) {
        let mut table = self.store.lock();
        if let Some(record) = table.get_mut(&self.service) {
            // a state change since admission already zeroed the slots
            if record.generation == self.generation {
                record.half_open_requests = record.half_open_requests.saturating_sub(1);
            }
        }
    }
}

/// Circuit breaker keyed by service name.
///
/// Clones share the same [`CircuitStore`], so every handle observes and
/// affects the same circuits. Use [`CircuitBreaker::with_store`] to inject a
/// store, or build separate breakers for isolated state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker<S = NullSink> {
    store: CircuitStore,
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    sink: S,
}

impl CircuitBreaker<NullSink> {
    /// Breaker with its own store, a monotonic clock and no telemetry.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            store: CircuitStore::new(),
            config: Arc::new(config),
            clock: Arc::new(MonotonicClock::default()),
            sink: NullSink,
        }
    }
}

impl<S> CircuitBreaker<S> {
    /// Use `store` instead of the breaker's own.
    pub fn with_store(mut self, store: CircuitStore) -> Self {
        self.store = store;
        self
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the clock with an already shared one.
    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Send call and transition events to `sink`.
    pub fn with_sink<T>(self, sink: T) -> CircuitBreaker<T> {
        CircuitBreaker { store: self.store, config: self.config, clock: self.clock, sink }
    }

    /// The config every circuit follows.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// The backing store.
    pub fn store(&self) -> &CircuitStore {
        &self.store
    }

    /// State of one circuit. Unknown services report a fresh closed circuit;
    /// no record is created.
    pub fn get_state(&self, service: &str) -> CircuitSnapshot {
        match self.store.get(service) {
            Some(record) => record.snapshot(),
            None => CircuitRecord::new(self.clock.now_millis()).snapshot(),
        }
    }

    /// Tracked service names, sorted.
    pub fn services(&self) -> Vec<String> {
        self.store.snapshot().into_iter().map(|(service, _)| service).collect()
    }

    /// Every tracked circuit, sorted by service name.
    pub fn snapshot_all(&self) -> Vec<(String, CircuitSnapshot)> {
        self.store.snapshot()
    }

    fn admit(&self, service: &str) -> (Gate, Option<TransitionEvent>) {
        let now = self.clock.now_millis();
        let mut table = self.store.lock();
        let record = table.entry(service.to_owned()).or_insert_with(|| CircuitRecord::new(now));
        match record.status {
            CircuitState::Closed => (Gate::Pass { generation: record.generation, slot: None }, None),
            CircuitState::Open => {
                let open_for = Duration::from_millis(now.saturating_sub(record.state_changed_at));
                debug!(service, open_for_ms = open_for.as_millis() as u64, "call rejected: circuit open");
                (Gate::Open { open_for }, None)
            }
            CircuitState::HalfOpen => {
                let max = self.config.max_half_open_requests;
                if record.half_open_requests >= max {
                    record.enter(CircuitState::Open, now);
                    warn!(service, max, "half-open trial budget exceeded → open");
                    let transition = transition(
                        service,
                        CircuitState::HalfOpen,
                        CircuitState::Open,
                        TransitionReason::HalfOpenBudgetExceeded,
                    );
                    return (Gate::HalfOpenFull, Some(transition));
                }
                record.half_open_requests += 1;
                debug!(service, in_flight = record.half_open_requests, max, "half-open trial call");
                let slot = TrialSlot {
                    store: self.store.clone(),
                    service: service.to_owned(),
                    generation: record.generation,
                };
                (Gate::Pass { generation: record.generation, slot: Some(slot) }, None)
            }
        }
    }

    /// `admitted` is the generation a guarded call was admitted under; results
    /// from an earlier generation are stale and leave the record alone.
    fn on_success(&self, service: &str, admitted: Option<u64>) -> Option<TransitionEvent> {
        let now = self.clock.now_millis();
        let mut table = self.store.lock();
        let record = table.get_mut(service)?;
        if admitted.map_or(false, |generation| generation != record.generation) {
            debug!(service, "success from an earlier circuit state ignored");
            return None;
        }
        match record.status {
            CircuitState::Closed => {
                record.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                record.success_count += 1;
                if record.success_count < self.config.success_threshold {
                    debug!(
                        service,
                        successes = record.success_count,
                        threshold = self.config.success_threshold,
                        "half-open trial succeeded"
                    );
                    return None;
                }
                record.enter(CircuitState::Closed, now);
                info!(service, "Circuit breaker → closed");
                Some(transition(
                    service,
                    CircuitState::HalfOpen,
                    CircuitState::Closed,
                    TransitionReason::SuccessThreshold,
                ))
            }
            CircuitState::Open => {
                debug!(service, "success recorded while open; ignored");
                None
            }
        }
    }

    fn on_failure(
        &self,
        service: &str,
        classification: &Classification,
        admitted: Option<u64>,
    ) -> (bool, Option<TransitionEvent>) {
        if !self.config.policy.counts(classification) {
            debug!(
                service,
                category = %classification.category,
                status = ?classification.status,
                "failure not counted"
            );
            return (false, None);
        }

        let now = self.clock.now_millis();
        let mut table = self.store.lock();
        let record = match admitted {
            Some(generation) => match table.get_mut(service) {
                Some(record) if record.generation == generation => record,
                _ => {
                    debug!(service, "failure from an earlier circuit state ignored");
                    return (false, None);
                }
            },
            None => table.entry(service.to_owned()).or_insert_with(|| CircuitRecord::new(now)),
        };
        record.failure_count = record.failure_count.saturating_add(1);
        record.last_failure_time = Some(now);
        let failures = record.failure_count;

        let event = match record.status {
            CircuitState::Closed if failures >= self.config.failure_threshold => {
                record.enter(CircuitState::Open, now);
                error!(
                    service,
                    failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker → open"
                );
                Some(transition(
                    service,
                    CircuitState::Closed,
                    CircuitState::Open,
                    TransitionReason::FailureThreshold,
                ))
            }
            CircuitState::HalfOpen => {
                record.enter(CircuitState::Open, now);
                warn!(service, failures, "Circuit breaker: test failed → open");
                Some(transition(
                    service,
                    CircuitState::HalfOpen,
                    CircuitState::Open,
                    TransitionReason::TrialFailed,
                ))
            }
            _ => None,
        };
        (true, event)
    }
}

impl<S> CircuitBreaker<S>
where
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Run `operation` under the circuit for `service`.
    ///
    /// # Behavior
    /// - **Closed**: runs the operation. Counted failures accumulate; a success
    ///   resets the streak.
    /// - **Open**: returns [`CallError::CircuitOpen`] without running it.
    /// - **HalfOpen**: runs it if a trial slot is free. Otherwise returns
    ///   [`CallError::HalfOpenFull`] and re-opens the circuit.
    ///
    /// Errors are always surfaced in [`CallError::Failed`]; classification only
    /// decides whether they count. A panic in the operation is caught, counted
    /// as an `Unknown` failure and returned as [`CallError::Panicked`].
    ///
    /// A result only applies to the circuit state the call was admitted in.
    /// If the circuit changed state while the call ran, the result is still
    /// returned but is not recorded.
    pub async fn call<T, E, F, Fut>(&self, service: &str, operation: F) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        match self.run(service, operation).await {
            Ok(value) => CallOutcome::Ok(value),
            Err(err) => CallOutcome::Err(err),
        }
    }

    /// Like [`call`](Self::call), but run `fallback` whenever the primary call
    /// does not produce a value, including when it was rejected.
    ///
    /// The fallback receives the reason. If it fails or panics, the outcome
    /// keeps both the reason and the fallback's error.
    pub async fn call_with_fallback<T, E, F, Fut, FB, FbFut>(
        &self,
        service: &str,
        operation: F,
        fallback: FB,
    ) -> CallOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(&CallError<E>) -> FbFut,
        FbFut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let reason = match self.run(service, operation).await {
            Ok(value) => return CallOutcome::Ok(value),
            Err(reason) => reason,
        };

        let attempt = AssertUnwindSafe(async { fallback(&reason).await }).catch_unwind().await;
        match attempt {
            Ok(Ok(value)) => {
                debug!(service, "fallback produced a value");
                CallOutcome::Fallback { reason, value }
            }
            Ok(Err(fallback)) => {
                warn!(service, "fallback failed");
                CallOutcome::Err(CallError::FallbackFailed { reason: Box::new(reason), fallback })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(service, %message, "fallback panicked");
                CallOutcome::Err(CallError::FallbackPanicked { reason: Box::new(reason), message })
            }
        }
    }

    async fn run<T, E, F, Fut>(&self, service: &str, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify,
    {
        let (gate, transition) = self.admit(service);
        if let Some(transition) = transition {
            self.emit(GuardEvent::Transition(transition)).await;
        }

        let (admitted, slot) = match gate {
            Gate::Pass { generation, slot } => (Some(generation), slot),
            Gate::Open { open_for } => {
                self.emit_call(service, CallResult::Rejected(Rejection::CircuitOpen), Duration::ZERO)
                    .await;
                return Err(CallError::CircuitOpen { service: service.to_owned(), open_for });
            }
            Gate::HalfOpenFull => {
                self.emit_call(service, CallResult::Rejected(Rejection::HalfOpenFull), Duration::ZERO)
                    .await;
                return Err(CallError::HalfOpenFull {
                    service: service.to_owned(),
                    max: self.config.max_half_open_requests,
                });
            }
        };

        let started = Instant::now();
        let result = AssertUnwindSafe(async move { operation().await }).catch_unwind().await;
        let duration = started.elapsed();
        drop(slot);

        match result {
            Ok(Ok(value)) => {
                let transition = self.on_success(service, admitted);
                self.emit_call(service, CallResult::Success, duration).await;
                self.emit_transition(transition).await;
                Ok(value)
            }
            Ok(Err(error)) => {
                let classification = error.classify();
                let (counted, transition) = self.on_failure(service, &classification, admitted);
                let category = classification.category;
                self.emit_call(service, CallResult::Failure { category, counted }, duration).await;
                self.emit_transition(transition).await;
                Err(CallError::Failed { service: service.to_owned(), error, category, counted })
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(service, %message, "guarded call panicked");
                let (_, transition) = self.on_failure(service, &Classification::UNKNOWN, admitted);
                self.emit_call(service, CallResult::Panicked, duration).await;
                self.emit_transition(transition).await;
                Err(CallError::Panicked { service: service.to_owned(), message })
            }
        }
    }

    /// Record a success observed outside [`call`](Self::call).
    pub async fn record_success(&self, service: &str) {
        let transition = self.on_success(service, None);
        self.emit_transition(transition).await;
    }

    /// Record a failure observed outside [`call`](Self::call). Returns whether
    /// the error counted toward the failure threshold.
    pub async fn record_failure<E: Classify + ?Sized>(&self, service: &str, error: &E) -> bool {
        let (counted, transition) = self.on_failure(service, &error.classify(), None);
        self.emit_transition(transition).await;
        counted
    }

    /// Put a circuit into `status`. Returns `false` if it was already there.
    pub async fn force_state(&self, service: &str, status: CircuitState) -> bool {
        let now = self.clock.now_millis();
        let transition = {
            let mut table = self.store.lock();
            let record =
                table.entry(service.to_owned()).or_insert_with(|| CircuitRecord::new(now));
            if record.status == status {
                return false;
            }
            let from = record.enter(status, now);
            warn!(service, %from, to = %status, "circuit state forced");
            transition(service, from, status, TransitionReason::Forced)
        };
        self.emit(GuardEvent::Transition(transition)).await;
        true
    }

    /// Forget a circuit; it starts closed on next use. Returns `false` if it
    /// was not tracked.
    pub async fn reset(&self, service: &str) -> bool {
        let Some(record) = self.store.remove(service) else {
            return false;
        };
        info!(service, from = %record.status, "circuit reset");
        if record.status != CircuitState::Closed {
            let event = transition(service, record.status, CircuitState::Closed, TransitionReason::Reset);
            self.emit(GuardEvent::Transition(event)).await;
        }
        true
    }

    /// Forget every circuit. Returns how many were tracked.
    pub async fn reset_all(&self) -> usize {
        let drained = self.store.drain();
        info!(count = drained.len(), "all circuits reset");
        for (service, record) in &drained {
            if record.status != CircuitState::Closed {
                let event =
                    transition(service, record.status, CircuitState::Closed, TransitionReason::Reset);
                self.emit(GuardEvent::Transition(event)).await;
            }
        }
        drained.len()
    }

    /// Move every open circuit whose recovery timeout has elapsed to
    /// half-open. Returns how many moved.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let recovery = self.config.recovery_millis();
        let transitions: Vec<TransitionEvent> = {
            let mut table = self.store.lock();
            let mut moved = Vec::new();
            for (service, record) in table.iter_mut() {
                if record.state_changed_at > now {
                    warn!(
                        service = %service,
                        state_changed_at = record.state_changed_at,
                        now,
                        "repaired circuit timestamp from the future"
                    );
                    record.state_changed_at = now;
                }
                if record.status == CircuitState::Open
                    && now - record.state_changed_at >= recovery
                {
                    record.enter(CircuitState::HalfOpen, now);
                    info!(service = %service, "Circuit breaker → half-open");
                    moved.push(transition(
                        service,
                        CircuitState::Open,
                        CircuitState::HalfOpen,
                        TransitionReason::RecoveryTimeout,
                    ));
                }
            }
            moved
        };

        let moved = transitions.len();
        for event in transitions {
            self.emit(GuardEvent::Transition(event)).await;
        }
        moved
    }

    /// Run [`CircuitBreaker::sweep`] every `every` on `scheduler`.
    pub fn start(
        &self,
        scheduler: &dyn Scheduler,
        every: Duration,
    ) -> Result<TickHandle, SchedulerError>
    where
        S: Sync,
    {
        let breaker = self.clone();
        scheduler.schedule(
            "circuit_recovery",
            every,
            Arc::new(move || {
                let breaker = breaker.clone();
                async move {
                    let moved = breaker.sweep().await;
                    tracing::trace!(moved, "recovery sweep");
                }
                .boxed()
            }),
        )
    }

    async fn emit(&self, event: GuardEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    async fn emit_call(&self, service: &str, result: CallResult, duration: Duration) {
        self.emit(GuardEvent::Call(CallEvent { service: service.to_owned(), result, duration }))
            .await;
    }

    async fn emit_transition(&self, transition: Option<TransitionEvent>) {
        if let Some(transition) = transition {
            self.emit(GuardEvent::Transition(transition)).await;
        }
    }
}

fn transition(
    service: &str,
    from: CircuitState,
    to: CircuitState,
    reason: TransitionReason,
) -> TransitionEvent {
    TransitionEvent { service: service.to_owned(), from, to, reason }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use crate::clock::ManualClock;
    use crate::error::ApiError;
    use crate::scheduler::ManualScheduler;
    use crate::telemetry::MemorySink;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(failures: usize, recovery_secs: u64, successes: usize, trials: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(failures, Duration::from_secs(recovery_secs), successes, trials)
            .unwrap()
    }

    fn breaker(cfg: CircuitBreakerConfig) -> (CircuitBreaker<MemorySink>, ManualClock, MemorySink) {
        let clock = ManualClock::starting_at(1_000);
        let sink = MemorySink::new();
        let breaker = CircuitBreaker::new(cfg).with_clock(clock.clone()).with_sink(sink.clone());
        (breaker, clock, sink)
    }

    async fn fail_with(b: &CircuitBreaker<MemorySink>, status: u16) -> CallOutcome<u32, ApiError> {
        b.call("geocode", || async move { Err(ApiError::status(status, "upstream")) }).await
    }

    async fn succeed(b: &CircuitBreaker<MemorySink>) -> CallOutcome<u32, ApiError> {
        b.call("geocode", || async { Ok(7) }).await
    }

    async fn open_then_half_open(b: &CircuitBreaker<MemorySink>, clock: &ManualClock) {
        for _ in 0..b.config().failure_threshold() {
            fail_with(b, 503).await;
        }
        assert_eq!(b.get_state("geocode").status, CircuitState::Open);
        clock.advance(b.config().recovery_timeout());
        assert_eq!(b.sweep().await, 1);
        assert_eq!(b.get_state("geocode").status, CircuitState::HalfOpen);
    }

    #[test]
    fn builder_defaults_and_validation() {
        let cfg = CircuitBreakerConfig::builder().build().unwrap();
        assert_eq!(cfg.failure_threshold(), 5);
        assert_eq!(cfg.recovery_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.success_threshold(), 3);
        assert_eq!(cfg.max_half_open_requests(), 3);
        assert_eq!(cfg.policy(), &FailurePolicy::new());

        let err = CircuitBreakerConfig::builder().failure_threshold(0).build().unwrap_err();
        assert_eq!(err, ConfigError::ZeroFailureThreshold);
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::ZERO, 1, 1).unwrap_err(),
            ConfigError::ZeroRecoveryTimeout
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::from_secs(1), 0, 1).unwrap_err(),
            ConfigError::ZeroSuccessThreshold
        );
        assert_eq!(
            CircuitBreakerConfig::new(1, Duration::from_secs(1), 1, 0).unwrap_err(),
            ConfigError::ZeroHalfOpenLimit
        );
    }

    #[tokio::test]
    async fn five_counted_failures_open_the_circuit() {
        let (b, _clock, sink) = breaker(config(5, 30, 3, 3));
        for _ in 0..4 {
            assert!(b.record_failure("geocode", &ApiError::status(500, "boom")).await);
        }
        assert_eq!(b.get_state("geocode").status, CircuitState::Closed);
        assert!(b.record_failure("geocode", &ApiError::Timeout(Duration::from_secs(2))).await);

        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::Open);
        assert_eq!(state.failure_count, 5);
        assert_eq!(state.last_failure_time, Some(1_000));
        assert_eq!(sink.transitions()[0].reason, TransitionReason::FailureThreshold);
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let (b, _clock, _sink) = breaker(config(3, 30, 1, 1));
        fail_with(&b, 503).await;
        fail_with(&b, 503).await;
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.get_state("geocode").failure_count, 0);
        fail_with(&b, 503).await;
        fail_with(&b, 503).await;
        assert_eq!(b.get_state("geocode").status, CircuitState::Closed);
    }

    #[tokio::test]
    async fn client_errors_never_count() {
        let (b, _clock, sink) = breaker(config(1, 30, 1, 1));
        for status in [400, 401, 403, 404, 429] {
            match fail_with(&b, status).await {
                CallOutcome::Err(CallError::Failed { counted, category, .. }) => {
                    assert!(!counted, "{status} should not count");
                    assert!(matches!(category, ErrorCategory::ClientError | ErrorCategory::RateLimited));
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(sink.calls().len(), 5);
        assert!(sink.transitions().is_empty());
    }

    #[tokio::test]
    async fn open_circuit_skips_the_call() {
        let (b, clock, sink) = breaker(config(1, 30, 1, 1));
        fail_with(&b, 502).await;
        clock.advance(Duration::from_secs(4));

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let outcome = b
            .call("geocode", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, ApiError>(1)
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        match outcome {
            CallOutcome::Err(CallError::CircuitOpen { service, open_for }) => {
                assert_eq!(service, "geocode");
                assert_eq!(open_for, Duration::from_secs(4));
            }
            other => panic!("expected circuit open, got {other:?}"),
        }
        assert_eq!(
            sink.calls().last().unwrap().result,
            CallResult::Rejected(Rejection::CircuitOpen)
        );
    }

    #[tokio::test]
    async fn fallback_runs_when_open() {
        let (b, _clock, _sink) = breaker(config(1, 30, 1, 1));
        fail_with(&b, 500).await;

        let outcome = b
            .call_with_fallback(
                "geocode",
                || async { Ok::<u32, ApiError>(1) },
                |reason| {
                    assert!(reason.is_circuit_open());
                    async { Ok(99) }
                },
            )
            .await;
        assert!(outcome.is_fallback());
        assert_eq!(outcome.value(), Some(&99));
        assert!(outcome.reason().unwrap().is_circuit_open());
        assert_eq!(outcome.into_result().unwrap(), 99);
    }

    #[tokio::test]
    async fn recovery_is_time_gated_and_sweep_driven() {
        let (b, clock, sink) = breaker(config(5, 30, 3, 3));
        for _ in 0..5 {
            b.record_failure("geocode", &ApiError::status(503, "down")).await;
        }

        clock.advance(Duration::from_secs(29));
        assert_eq!(b.sweep().await, 0);
        assert_eq!(b.get_state("geocode").status, CircuitState::Open);

        clock.advance(Duration::from_secs(2));
        // calls alone never leave Open
        assert!(succeed(&b).await.reason().unwrap().is_circuit_open());
        assert_eq!(b.get_state("geocode").status, CircuitState::Open);

        assert_eq!(b.sweep().await, 1);
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::HalfOpen);
        assert_eq!(state.state_changed_at, 32_000);
        assert_eq!(sink.transitions().last().unwrap().reason, TransitionReason::RecoveryTimeout);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_streak() {
        let (b, clock, sink) = breaker(config(2, 10, 3, 3));
        open_then_half_open(&b, &clock).await;

        assert!(succeed(&b).await.is_ok());
        assert!(succeed(&b).await.is_ok());
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::HalfOpen);
        assert_eq!(state.success_count, 2);
        assert_eq!(state.half_open_requests, 0);

        assert!(succeed(&b).await.is_ok());
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert_eq!(state.success_count, 0);

        let reasons: Vec<_> = sink.transitions().into_iter().map(|t| t.reason).collect();
        assert_eq!(
            reasons,
            vec![
                TransitionReason::FailureThreshold,
                TransitionReason::RecoveryTimeout,
                TransitionReason::SuccessThreshold
            ]
        );
    }

    #[tokio::test]
    async fn half_open_reopens_on_one_failure() {
        let (b, clock, sink) = breaker(config(2, 10, 3, 3));
        open_then_half_open(&b, &clock).await;
        assert!(succeed(&b).await.is_ok());

        clock.advance(Duration::from_millis(250));
        fail_with(&b, 500).await;
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::Open);
        assert_eq!(state.success_count, 0);
        assert_eq!(state.state_changed_at, clock.now_millis());
        assert_eq!(sink.transitions().last().unwrap().reason, TransitionReason::TrialFailed);
    }

    #[tokio::test]
    async fn fourth_concurrent_trial_is_rejected() {
        let (b, clock, sink) = breaker(config(1, 30, 3, 3));
        open_then_half_open(&b, &clock).await;

        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let mut trials = Vec::new();
        for _ in 0..3 {
            let b = b.clone();
            let gate = gate.clone();
            trials.push(tokio::spawn(async move {
                b.call("geocode", || async move {
                    let _permit = gate.acquire().await;
                    Ok::<u32, ApiError>(1)
                })
                .await
                .is_ok()
            }));
        }
        for _ in 0..100 {
            if b.get_state("geocode").half_open_requests == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(b.get_state("geocode").half_open_requests, 3);

        let invoked = Arc::new(AtomicUsize::new(0));
        let counter = invoked.clone();
        let fourth = b
            .call("geocode", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, ApiError>(1)
            })
            .await;
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert!(matches!(fourth, CallOutcome::Err(CallError::HalfOpenFull { max: 3, .. })));
        assert_eq!(b.get_state("geocode").status, CircuitState::Open);
        assert_eq!(
            sink.transitions().last().unwrap().reason,
            TransitionReason::HalfOpenBudgetExceeded
        );

        gate.add_permits(3);
        for trial in trials {
            assert!(trial.await.unwrap());
        }
        // late successes do not close a re-opened circuit
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::Open);
        assert_eq!(state.half_open_requests, 0);
    }

    #[tokio::test]
    async fn late_trial_results_do_not_touch_a_newer_half_open_window() {
        let (b, clock, _sink) = breaker(config(1, 30, 1, 1));
        open_then_half_open(&b, &clock).await;

        async fn hold_trial(
            b: &CircuitBreaker<MemorySink>,
            clock: &ManualClock,
            status: Option<u16>,
        ) -> CallOutcome<u32, ApiError> {
            let gate = Arc::new(tokio::sync::Semaphore::new(0));
            let trial = {
                let b = b.clone();
                let gate = gate.clone();
                tokio::spawn(async move {
                    b.call("geocode", move || async move {
                        let _permit = gate.acquire().await;
                        match status {
                            Some(status) => Err(ApiError::status(status, "down")),
                            None => Ok::<u32, ApiError>(1),
                        }
                    })
                    .await
                })
            };
            while b.get_state("geocode").half_open_requests < 1 {
                tokio::task::yield_now().await;
            }

            // the excess call re-opens; the next sweep starts a new half-open window
            assert!(matches!(succeed(b).await, CallOutcome::Err(CallError::HalfOpenFull { .. })));
            clock.advance(Duration::from_secs(30));
            assert_eq!(b.sweep().await, 1);

            gate.add_permits(1);
            trial.await.unwrap()
        }

        let late_success = hold_trial(&b, &clock, None).await;
        assert!(late_success.is_ok());
        let state = b.get_state("geocode");
        assert_eq!(state.status, CircuitState::HalfOpen);
        assert_eq!(state.success_count, 0);
        assert_eq!(state.half_open_requests, 0);

        let late_failure = hold_trial(&b, &clock, Some(503)).await;
        match late_failure {
            CallOutcome::Err(CallError::Failed { counted, .. }) => assert!(!counted),
            other => panic!("expected surfaced failure, got {other:?}"),
        }
        assert_eq!(b.get_state("geocode").status, CircuitState::HalfOpen);

        // a trial from the current window still decides
        assert!(succeed(&b).await.is_ok());
        assert_eq!(b.get_state("geocode").status, CircuitState::Closed);
    }

    #[tokio::test]
    async fn closed_calls_finishing_after_recovery_are_ignored() {
        let (b, clock, _sink) = breaker(config(1, 30, 2, 3));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let slow = {
            let b = b.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                b.call("geocode", move || async move {
                    let _permit = gate.acquire().await;
                    Ok::<u32, ApiError>(1)
                })
                .await
            })
        };
        while b.services().is_empty() {
            tokio::task::yield_now().await;
        }

        fail_with(&b, 503).await;
        clock.advance(Duration::from_secs(30));
        assert_eq!(b.sweep().await, 1);

        gate.add_permits(1);
        assert!(slow.await.unwrap().is_ok());
        assert_eq!(b.get_state("geocode").success_count, 0);

        // explicit recording has no admission to compare against
        b.record_success("geocode").await;
        assert_eq!(b.get_state("geocode").success_count, 1);
    }

    #[tokio::test]
    async fn cancelled_trial_releases_its_slot() {
        let (b, clock, _sink) = breaker(config(1, 30, 1, 1));
        open_then_half_open(&b, &clock).await;

        let mut pending =
            Box::pin(b.call("geocode", || std::future::pending::<Result<u32, ApiError>>()));
        assert!(futures::poll!(pending.as_mut()).is_pending());
        assert_eq!(b.get_state("geocode").half_open_requests, 1);
        drop(pending);
        assert_eq!(b.get_state("geocode").half_open_requests, 0);
        assert_eq!(b.get_state("geocode").status, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn panics_are_caught_and_counted() {
        let (b, _clock, sink) = breaker(config(1, 30, 1, 1));
        let explode = true;
        let outcome = b
            .call("geocode", move || async move {
                if explode {
                    panic!("decoder exploded");
                }
                Ok::<u32, ApiError>(1)
            })
            .await;
        match outcome {
            CallOutcome::Err(CallError::Panicked { message, .. }) => {
                assert_eq!(message, "decoder exploded")
            }
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert_eq!(b.get_state("geocode").status, CircuitState::Open);
        assert_eq!(sink.calls()[0].result, CallResult::Panicked);
    }

    #[tokio::test]
    async fn fallback_failure_keeps_both_errors() {
        let (b, _clock, _sink) = breaker(config(5, 30, 1, 1));
        let explode = true;
        let outcome = b
            .call_with_fallback(
                "geocode",
                || async { Err::<u32, _>(ApiError::status(503, "down")) },
                |_| async { Err(ApiError::Other("cache miss".into())) },
            )
            .await;
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.as_inner(), Some(&ApiError::status(503, "down")));
        assert_eq!(err.fallback_error(), Some(&ApiError::Other("cache miss".into())));

        let outcome = b
            .call_with_fallback(
                "geocode",
                || async { Err::<u32, _>(ApiError::status(503, "down")) },
                move |_| async move {
                    if explode {
                        panic!("cache poisoned");
                    }
                    Ok(0)
                },
            )
            .await;
        match outcome {
            CallOutcome::Err(CallError::FallbackPanicked { message, reason }) => {
                assert_eq!(message, "cache poisoned");
                assert!(reason.as_inner().is_some());
            }
            other => panic!("expected fallback panic, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn force_and_reset_emit_transitions() {
        let (b, _clock, sink) = breaker(config(5, 30, 1, 1));
        assert!(b.force_state("places", CircuitState::Open).await);
        assert!(!b.force_state("places", CircuitState::Open).await);
        assert_eq!(b.get_state("places").status, CircuitState::Open);

        assert!(b.reset("places").await);
        assert!(!b.reset("places").await);
        assert!(b.services().is_empty());

        b.force_state("a", CircuitState::HalfOpen).await;
        b.record_success("b").await;
        b.record_failure("b", &ApiError::status(500, "x")).await;
        assert_eq!(b.services(), vec!["a", "b"]);
        assert_eq!(b.reset_all().await, 2);

        let reasons: Vec<_> = sink.transitions().into_iter().map(|t| t.reason).collect();
        assert_eq!(
            reasons,
            vec![
                TransitionReason::Forced,
                TransitionReason::Reset,
                TransitionReason::Forced,
                TransitionReason::Reset
            ]
        );
    }

    #[tokio::test]
    async fn unknown_service_reports_closed_without_tracking() {
        let (b, _clock, _sink) = breaker(CircuitBreakerConfig::default());
        let state = b.get_state("never-called");
        assert_eq!(state.status, CircuitState::Closed);
        assert_eq!(state.failure_count, 0);
        assert!(b.snapshot_all().is_empty());

        b.record_success("never-called").await;
        assert!(!b.record_failure("never-called", &ApiError::status(404, "missing")).await);
        assert!(b.snapshot_all().is_empty());
    }

    #[tokio::test]
    async fn sweep_repairs_future_timestamps() {
        let (b, clock, _sink) = breaker(config(1, 10, 1, 1));
        let mut record = CircuitRecord::new(u64::MAX);
        record.status = CircuitState::Open;
        b.store().insert("geocode", record);

        assert_eq!(b.sweep().await, 0);
        assert_eq!(b.get_state("geocode").state_changed_at, 1_000);
        clock.advance(Duration::from_secs(10));
        assert_eq!(b.sweep().await, 1);
    }

    #[tokio::test]
    async fn scheduled_sweep_recovers_circuits() {
        let (b, clock, _sink) = breaker(config(1, 30, 1, 1));
        let scheduler = ManualScheduler::new();
        let handle = b.start(&scheduler, Duration::from_secs(5)).unwrap();
        assert_eq!(handle.name(), "circuit_recovery");

        fail_with(&b, 500).await;
        clock.advance(Duration::from_secs(30));
        assert_eq!(scheduler.fire("circuit_recovery").await, 1);
        assert_eq!(b.get_state("geocode").status, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn shared_store_is_shared_between_breakers() {
        let store = CircuitStore::new();
        let a = CircuitBreaker::new(config(1, 30, 1, 1)).with_store(store.clone());
        let b = CircuitBreaker::new(config(1, 30, 1, 1)).with_store(store);
        a.record_failure("geocode", &ApiError::ConnectionRefused("refused".into())).await;
        assert_eq!(b.get_state("geocode").status, CircuitState::Open);

        let isolated = CircuitBreaker::new(config(1, 30, 1, 1));
        assert_eq!(isolated.get_state("geocode").status, CircuitState::Closed);
    }
}

use super::events::{CallEvent, CallResult, GuardEvent, TransitionEvent};
use crate::circuit_breaker::CircuitState;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::{Service, ServiceExt};

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

const LOG_TARGET: &str = "geoguard::telemetry";

/// Destination for [`GuardEvent`]s.
///
/// Any cloneable `tower::Service<GuardEvent>` qualifies; the breaker and the
/// guard clone the sink per event and drive it with [`emit_best_effort`].
pub trait TelemetrySink:
    Service<GuardEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// Error the sink reports when it cannot take an event.
    type SinkError: std::error::Error + Send + 'static;
}

/// Hands `event` to `sink`, waiting for readiness first. Readiness and call
/// errors are dropped; telemetry never fails a guarded call.
pub async fn emit_best_effort<S>(sink: S, event: GuardEvent)
where
    S: Service<GuardEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    if let Err(error) = sink.oneshot(event).await {
        tracing::trace!(target: LOG_TARGET, %error, "telemetry event dropped");
    }
}

/// Discards every event. Default sink of the breaker and the guard.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl Service<GuardEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: GuardEvent) -> Self::Future {
        std::future::ready(Ok(()))
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Writes events to `tracing` under the `geoguard::telemetry` target.
///
/// A circuit opening is a warning, other transitions are info. Failed and
/// rejected calls log at debug, successes at trace.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl LogSink {
    fn log_transition(event: &TransitionEvent) {
        let TransitionEvent { service, from, to, reason } = event;
        if *to == CircuitState::Open {
            tracing::warn!(target: LOG_TARGET, %service, %from, %to, ?reason, "circuit opened");
        } else {
            tracing::info!(target: LOG_TARGET, %service, %from, %to, ?reason, "circuit state changed");
        }
    }

    fn log_call(event: &CallEvent) {
        let CallEvent { service, result, duration } = event;
        match result {
            CallResult::Success => {
                tracing::trace!(target: LOG_TARGET, %service, ?duration, "call succeeded")
            }
            CallResult::Failure { category, counted } => {
                tracing::debug!(target: LOG_TARGET, %service, %category, counted, ?duration, "call failed")
            }
            CallResult::Panicked => {
                tracing::debug!(target: LOG_TARGET, %service, ?duration, "call panicked")
            }
            CallResult::Rejected(rejection) => {
                tracing::debug!(target: LOG_TARGET, %service, ?rejection, "call rejected by circuit")
            }
            CallResult::RateLimited { window } => {
                tracing::debug!(target: LOG_TARGET, %service, %window, "call rate limited")
            }
        }
    }
}

impl Service<GuardEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        match &event {
            GuardEvent::Transition(transition) => Self::log_transition(transition),
            GuardEvent::Call(call) => Self::log_call(call),
        }
        std::future::ready(Ok(()))
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Ring buffer of recent events, shared between clones.
///
/// Once full, the oldest event is evicted for each new one.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<GuardEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Buffer holding the last 10 000 events.
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    /// Buffer holding the last `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1_024)))),
            capacity,
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<GuardEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every buffered event, oldest first.
    pub fn events(&self) -> Vec<GuardEvent> {
        self.lock().iter().cloned().collect()
    }

    /// Buffered call events, oldest first.
    pub fn calls(&self) -> Vec<CallEvent> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                GuardEvent::Call(call) => Some(call.clone()),
                GuardEvent::Transition(_) => None,
            })
            .collect()
    }

    /// Buffered transition events, oldest first.
    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                GuardEvent::Transition(transition) => Some(transition.clone()),
                GuardEvent::Call(_) => None,
            })
            .collect()
    }

    /// The states one service's circuit moved through, in order.
    pub fn state_path(&self, service: &str) -> Vec<CircuitState> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                GuardEvent::Transition(t) if t.service == service => Some(t.to),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Events currently buffered.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Events dropped to make room since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn push(&self, event: GuardEvent) {
        let mut events = self.lock();
        if events.len() >= self.capacity {
            events.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push_back(event);
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<GuardEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = std::future::Ready<Result<(), Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        self.push(event);
        std::future::ready(Ok(()))
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Sends circuit transitions and call events to different sinks.
///
/// Transitions are rare and worth keeping; call events arrive once per
/// request. A typical split logs transitions and buffers (or drops) calls:
///
/// ```rust
/// use geoguard::telemetry::{LogSink, MemorySink, SplitSink};
///
/// let calls = MemorySink::with_capacity(256);
/// let sink = SplitSink::new(LogSink, calls.clone());
/// # let _ = sink;
/// ```
#[derive(Clone, Debug)]
pub struct SplitSink<T, C> {
    transitions: T,
    calls: C,
}

impl<T, C> SplitSink<T, C> {
    /// Transitions go to `transitions`, call events to `calls`.
    pub fn new(transitions: T, calls: C) -> Self {
        Self { transitions, calls }
    }
}

impl<T> SplitSink<T, NullSink> {
    /// Keeps transitions only; call events are discarded.
    pub fn transitions_only(transitions: T) -> Self {
        Self::new(transitions, NullSink)
    }
}

impl<T, C> Service<GuardEvent> for SplitSink<T, C>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
    C: TelemetrySink,
    C::Future: Send + 'static,
{
    type Response = ();
    type Error = SplitSinkError<T::SinkError, C::SinkError>;
    type Future = SinkFuture<Self::Error>;

    // Readiness is checked on the routed sink inside `call`.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: GuardEvent) -> Self::Future {
        match event {
            GuardEvent::Transition(_) => {
                let sink = self.transitions.clone();
                Box::pin(async move { sink.oneshot(event).await.map_err(SplitSinkError::Transitions) })
            }
            GuardEvent::Call(_) => {
                let sink = self.calls.clone();
                Box::pin(async move { sink.oneshot(event).await.map_err(SplitSinkError::Calls) })
            }
        }
    }
}

impl<T, C> TelemetrySink for SplitSink<T, C>
where
    T: TelemetrySink,
    T::Future: Send + 'static,
    C: TelemetrySink,
    C::Future: Send + 'static,
{
    type SinkError = SplitSinkError<T::SinkError, C::SinkError>;
}

/// Failure of one side of a [`SplitSink`].
#[derive(Debug)]
pub enum SplitSinkError<T, C> {
    /// The transition sink failed.
    Transitions(T),
    /// The call sink failed.
    Calls(C),
}

impl<T: fmt::Display, C: fmt::Display> fmt::Display for SplitSinkError<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transitions(error) => write!(f, "transition sink failed: {}", error),
            Self::Calls(error) => write!(f, "call sink failed: {}", error),
        }
    }
}

impl<T, C> std::error::Error for SplitSinkError<T, C>
where
    T: std::error::Error + 'static,
    C: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transitions(error) => Some(error),
            Self::Calls(error) => Some(error),
        }
    }
}

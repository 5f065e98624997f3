//! Convenient re-exports for common geoguard types.
pub use crate::{
    circuit_breaker::{CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitState},
    classify::{Classify, ErrorCategory, FailurePolicy},
    config::GuardConfig,
    error::{ApiError, CallError, ResilienceError},
    guard::{ApiGuard, GuardOutcome},
    rate_limit::{Admission, RateLimitLayer, RateLimiter, Window},
    scheduler::{Scheduler, TokioScheduler},
    telemetry::{GuardEvent, TelemetrySink},
};

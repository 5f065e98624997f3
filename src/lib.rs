#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # geoguard
//!
//! Resilience for calls to a quota-limited, occasionally degraded
//! geocoding/places provider: a multi-window token-bucket rate limiter and a
//! per-service circuit breaker, plus the glue that sequences them.
//!
//! ## Features
//!
//! - **Rate limiting** per `(endpoint, identifier)` across second, minute,
//!   hour and day windows, with all-or-nothing admission
//! - **Circuit breakers** per service with classified failures, fallbacks and
//!   sweep-driven recovery
//! - **Injectable time**: [`Clock`] and [`Scheduler`] abstractions so tests
//!   never wait on the wall clock
//! - **Telemetry** as `tower::Service` sinks
//! - **Tower middleware** for rate limiting existing services
//!
//! ## Quick Start
//!
//! ```rust
//! use geoguard::{ApiError, ApiGuard, GuardConfig, GuardOutcome, TokioScheduler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let guard = ApiGuard::new(GuardConfig::geocoding());
//!     let _sweeps = guard.start(&TokioScheduler)?;
//!
//!     let outcome = guard
//!         .execute_with_fallback(
//!             "geocode",
//!             "api-key-1",
//!             || async { Ok::<_, ApiError>((18.4655, -66.1057)) },
//!             |_reason| async { Ok((0.0, 0.0)) },
//!         )
//!         .await;
//!
//!     match outcome {
//!         GuardOutcome::Limited { retry_after_secs, .. } => {
//!             println!("slow down, retry in {retry_after_secs}s")
//!         }
//!         GuardOutcome::Completed(call) => println!("{:?}", call.value()),
//!     }
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod prelude;
pub mod rate_limit;
pub mod scheduler;
pub mod telemetry;

// Re-exports
pub use circuit_breaker::{
    CallOutcome, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder,
    CircuitRecord, CircuitSnapshot, CircuitState, CircuitStore,
};
pub use classify::{classify_error, Classification, Classify, ErrorCategory, FailurePolicy};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{GuardConfig, GuardConfigBuilder, TickIntervals};
pub use error::{ApiError, CallError, ConfigError, ResilienceError, SchedulerError};
pub use guard::{ApiGuard, GuardOutcome, HealthReport, SweepHandles};
pub use rate_limit::{
    Admission, BucketStore, RateLimitLayer, RateLimitService, RateLimiter, ResetScope, Window,
    WindowLimits, WindowStatus,
};
pub use scheduler::{ManualScheduler, Scheduler, TickHandle, TokioScheduler};

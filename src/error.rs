//! Error types shared by the limiter, the breaker and their integrations.
use crate::classify::ErrorCategory;
use crate::rate_limit::Window;
use std::fmt;
use std::time::Duration;

/// Upstream failure as reported by a geocoding/places client wrapper.
///
/// Collaborators that build HTTP requests map their transport and status
/// failures into this type so the breaker can classify them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The request did not complete within the client's own deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The upstream host refused the connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// The upstream answered with a non-success HTTP status.
    #[error("upstream returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Provider-supplied message or body excerpt.
        message: String,
    },
    /// The provider signalled quota exhaustion without a status code
    /// (e.g. an `OVER_QUERY_LIMIT` body on a 200 response).
    #[error("upstream quota exhausted")]
    QuotaExceeded,
    /// Anything the wrapper could not map.
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// Shorthand for [`ApiError::Status`].
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status { status, message: message.into() }
    }
}

/// Why a guarded call did not produce a value from the primary call.
#[derive(Debug)]
pub enum CallError<E> {
    /// The circuit is open; the call was not attempted.
    CircuitOpen {
        /// Service the circuit protects.
        service: String,
        /// How long the circuit has been open.
        open_for: Duration,
    },
    /// The circuit is half-open and its trial budget is used up; the call was
    /// not attempted and the circuit re-opened.
    HalfOpenFull {
        /// Service the circuit protects.
        service: String,
        /// Configured trial budget.
        max: usize,
    },
    /// The call ran and returned an error.
    Failed {
        /// Service the circuit protects.
        service: String,
        /// The error returned by the call.
        error: E,
        /// Classification of `error`.
        category: ErrorCategory,
        /// Whether the error counted toward the failure threshold.
        counted: bool,
    },
    /// The call panicked; the panic was caught at the call boundary.
    Panicked {
        /// Service the circuit protects.
        service: String,
        /// Panic payload rendered as text, when it was a string.
        message: String,
    },
    /// The fallback ran after `reason` and failed as well.
    FallbackFailed {
        /// Why the fallback was needed.
        reason: Box<CallError<E>>,
        /// The fallback's own error.
        fallback: E,
    },
    /// The fallback ran after `reason` and panicked.
    FallbackPanicked {
        /// Why the fallback was needed.
        reason: Box<CallError<E>>,
        /// Panic payload rendered as text, when it was a string.
        message: String,
    },
}

impl<E> CallError<E> {
    /// Service the failed call targeted.
    pub fn service(&self) -> &str {
        match self {
            Self::CircuitOpen { service, .. }
            | Self::HalfOpenFull { service, .. }
            | Self::Failed { service, .. }
            | Self::Panicked { service, .. } => service,
            Self::FallbackFailed { reason, .. } | Self::FallbackPanicked { reason, .. } => {
                reason.service()
            }
        }
    }

    /// True when the call was rejected without running.
    pub fn is_rejected(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } | Self::HalfOpenFull { .. } => true,
            Self::FallbackFailed { reason, .. } | Self::FallbackPanicked { reason, .. } => {
                reason.is_rejected()
            }
            _ => false,
        }
    }

    /// True when the circuit was open.
    pub fn is_circuit_open(&self) -> bool {
        match self {
            Self::CircuitOpen { .. } => true,
            Self::FallbackFailed { reason, .. } | Self::FallbackPanicked { reason, .. } => {
                reason.is_circuit_open()
            }
            _ => false,
        }
    }

    /// Borrow the primary call's error if it ran and failed.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Failed { error, .. } => Some(error),
            Self::FallbackFailed { reason, .. } | Self::FallbackPanicked { reason, .. } => {
                reason.as_inner()
            }
            _ => None,
        }
    }

    /// Borrow the fallback's error if the fallback failed.
    pub fn fallback_error(&self) -> Option<&E> {
        match self {
            Self::FallbackFailed { fallback, .. } => Some(fallback),
            _ => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen { service, open_for } => {
                write!(f, "circuit '{}' is open (open for {:?})", service, open_for)
            }
            Self::HalfOpenFull { service, max } => {
                write!(f, "circuit '{}' is half-open with {} trial calls in flight", service, max)
            }
            Self::Failed { service, error, category, counted } => {
                let note = if *counted { "counted" } else { "not counted" };
                write!(f, "call to '{}' failed ({}, {}): {}", service, category, note, error)
            }
            Self::Panicked { service, message } => {
                write!(f, "call to '{}' panicked: {}", service, message)
            }
            Self::FallbackFailed { reason, fallback } => {
                write!(f, "{}; fallback failed: {}", reason, fallback)
            }
            Self::FallbackPanicked { reason, message } => {
                write!(f, "{}; fallback panicked: {}", reason, message)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Failed { error, .. } => Some(error),
            Self::FallbackFailed { fallback, .. } => Some(fallback),
            _ => None,
        }
    }
}

/// Error surfaced by the tower middleware.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// Admission was denied by the rate limiter.
    RateLimited {
        /// Whole seconds until a token is available.
        retry_after_secs: u64,
        /// The window that denied admission.
        window: Window,
    },
    /// The underlying service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs, window } => write!(
                f,
                "rate limited by {} window; retry after {}s",
                window, retry_after_secs
            ),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> ResilienceError<E> {
    /// Check if this error is a rate-limit denial.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Retry hint for denials.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after_secs, .. } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            _ => None,
        }
    }
}

/// Errors produced when validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Every window needs room for at least one token.
    #[error("{window} capacity must be > 0")]
    ZeroCapacity {
        /// Offending window.
        window: Window,
    },
    /// Failure threshold must be > 0.
    #[error("failure_threshold must be > 0")]
    ZeroFailureThreshold,
    /// Success threshold must be > 0.
    #[error("success_threshold must be > 0")]
    ZeroSuccessThreshold,
    /// Half-open trial limit must be > 0.
    #[error("max_half_open_requests must be > 0")]
    ZeroHalfOpenLimit,
    /// Recovery timeout must be > 0.
    #[error("recovery_timeout must be > 0")]
    ZeroRecoveryTimeout,
    /// Sweep intervals must be > 0.
    #[error("{name} tick interval must be > 0")]
    ZeroTickInterval {
        /// Which sweep.
        name: &'static str,
    },
}

/// Errors from [`crate::scheduler::Scheduler`] implementations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Tokio-backed scheduling was requested outside a runtime.
    #[error("cannot schedule '{name}': no tokio runtime is running")]
    NoRuntime {
        /// Name of the tick.
        name: &'static str,
    },
    /// A zero interval would spin.
    #[error("cannot schedule '{name}' with a zero interval")]
    ZeroInterval {
        /// Name of the tick.
        name: &'static str,
    },
}

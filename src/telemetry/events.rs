use crate::circuit_breaker::CircuitState;
use crate::classify::ErrorCategory;
use crate::rate_limit::Window;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted by the limiter, the breaker and the guard that joins them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardEvent {
    /// One guarded call finished (or was turned away).
    Call(CallEvent),
    /// A circuit changed state.
    Transition(TransitionEvent),
}

/// Outcome of one guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEvent {
    /// Service (endpoint) the call targeted.
    pub service: String,
    /// What happened.
    pub result: CallResult,
    /// Time spent in the primary call; zero for rejected calls.
    pub duration: Duration,
}

impl CallEvent {
    /// Duration in whole millis, saturating.
    pub fn duration_ms(&self) -> u64 {
        clamp_u64(self.duration.as_millis())
    }
}

/// Why a call was turned away without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The circuit was open.
    CircuitOpen,
    /// The circuit was half-open and every trial slot was taken.
    HalfOpenFull,
}

/// Result carried by a [`CallEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallResult {
    /// The call returned `Ok`.
    Success,
    /// The call returned an error.
    Failure {
        /// Classification of the error.
        category: ErrorCategory,
        /// Whether it counted toward the failure threshold.
        counted: bool,
    },
    /// The breaker did not let the call through.
    Rejected(Rejection),
    /// The call panicked.
    Panicked,
    /// The rate limiter did not admit the call.
    RateLimited {
        /// The window that denied admission.
        window: Window,
    },
}

/// Why a circuit changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    /// Consecutive counted failures reached the threshold.
    FailureThreshold,
    /// The recovery timeout elapsed and a sweep moved the circuit to half-open.
    RecoveryTimeout,
    /// Enough trial calls succeeded.
    SuccessThreshold,
    /// A trial call failed.
    TrialFailed,
    /// A call arrived while every trial slot was taken.
    HalfOpenBudgetExceeded,
    /// An operator forced the state.
    Forced,
    /// An operator reset the circuit.
    Reset,
}

impl TransitionReason {
    /// Snake-case name used in logs and JSON.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailureThreshold => "failure_threshold",
            Self::RecoveryTimeout => "recovery_timeout",
            Self::SuccessThreshold => "success_threshold",
            Self::TrialFailed => "trial_failed",
            Self::HalfOpenBudgetExceeded => "half_open_budget_exceeded",
            Self::Forced => "forced",
            Self::Reset => "reset",
        }
    }
}

/// A circuit moved from `from` to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEvent {
    /// Service the circuit protects.
    pub service: String,
    /// Previous state.
    pub from: CircuitState,
    /// New state.
    pub to: CircuitState,
    /// What triggered the change.
    pub reason: TransitionReason,
}

impl fmt::Display for GuardEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardEvent::Call(event) => write!(f, "Call::{}", event),
            GuardEvent::Transition(event) => write!(f, "Transition::{}", event),
        }
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, duration={:?})", self.service, self.result, self.duration)
    }
}

impl fmt::Display for CallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallResult::Success => write!(f, "Success"),
            CallResult::Failure { category, counted } => {
                write!(f, "Failure({}, counted={})", category, counted)
            }
            CallResult::Rejected(Rejection::CircuitOpen) => write!(f, "Rejected(circuit_open)"),
            CallResult::Rejected(Rejection::HalfOpenFull) => write!(f, "Rejected(half_open_full)"),
            CallResult::Panicked => write!(f, "Panicked"),
            CallResult::RateLimited { window } => write!(f, "RateLimited({})", window),
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({} -> {}, {})", self.service, self.from, self.to, self.reason.as_str())
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a [`GuardEvent`] into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &GuardEvent) -> serde_json::Value {
    match event {
        GuardEvent::Call(call) => {
            let mut value = json!({
                "kind": "call",
                "service": call.service,
                "duration_ms": call.duration_ms(),
            });
            let extra = match call.result {
                CallResult::Success => json!({ "result": "success" }),
                CallResult::Failure { category, counted } => json!({
                    "result": "failure",
                    "category": category.as_str(),
                    "counted": counted,
                }),
                CallResult::Rejected(Rejection::CircuitOpen) => {
                    json!({ "result": "rejected", "rejection": "circuit_open" })
                }
                CallResult::Rejected(Rejection::HalfOpenFull) => {
                    json!({ "result": "rejected", "rejection": "half_open_full" })
                }
                CallResult::Panicked => json!({ "result": "panicked" }),
                CallResult::RateLimited { window } => {
                    json!({ "result": "rate_limited", "window": window.as_str() })
                }
            };
            if let (Some(target), serde_json::Value::Object(fields)) = (value.as_object_mut(), extra)
            {
                target.extend(fields);
            }
            value
        }
        GuardEvent::Transition(t) => json!({
            "kind": "transition",
            "service": t.service,
            "from": t.from.as_str(),
            "to": t.to.as_str(),
            "reason": t.reason.as_str(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_compact() {
        let event = GuardEvent::Transition(TransitionEvent {
            service: "geocode".into(),
            from: CircuitState::Closed,
            to: CircuitState::Open,
            reason: TransitionReason::FailureThreshold,
        });
        assert_eq!(event.to_string(), "Transition::geocode(closed -> open, failure_threshold)");

        let call = GuardEvent::Call(CallEvent {
            service: "places".into(),
            result: CallResult::RateLimited { window: Window::Minute },
            duration: Duration::ZERO,
        });
        assert_eq!(call.to_string(), "Call::places(RateLimited(minute), duration=0ns)");
    }

    #[test]
    fn duration_ms_saturates() {
        let call = CallEvent {
            service: "geocode".into(),
            result: CallResult::Success,
            duration: Duration::MAX,
        };
        assert_eq!(call.duration_ms(), u64::MAX);
    }

    #[cfg(feature = "telemetry-json")]
    #[test]
    fn json_shapes() {
        let failure = GuardEvent::Call(CallEvent {
            service: "geocode".into(),
            result: CallResult::Failure { category: ErrorCategory::ServerError, counted: true },
            duration: Duration::from_millis(42),
        });
        let value = event_to_json(&failure);
        assert_eq!(value["kind"], "call");
        assert_eq!(value["result"], "failure");
        assert_eq!(value["category"], "server_error");
        assert_eq!(value["counted"], true);
        assert_eq!(value["duration_ms"], 42);

        let transition = GuardEvent::Transition(TransitionEvent {
            service: "geocode".into(),
            from: CircuitState::Open,
            to: CircuitState::HalfOpen,
            reason: TransitionReason::RecoveryTimeout,
        });
        let value = event_to_json(&transition);
        assert_eq!(value["to"], "half_open");
        assert_eq!(value["reason"], "recovery_timeout");
    }
}

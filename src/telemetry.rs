//! Telemetry for guarded calls.
//!
//! The breaker and the guard emit [`GuardEvent`]s: one [`CallEvent`] per
//! guarded call and one [`TransitionEvent`] per circuit state change. Events
//! flow through [`TelemetrySink`] implementations, which are plain
//! `tower::Service<GuardEvent>`s. [`SplitSink`] sends transitions and call
//! events to different sinks.
//!
//! Emission is best effort: a sink that is not ready or that fails never
//! affects the call being guarded.
//!
//! ```rust
//! use geoguard::telemetry::{CallEvent, CallResult, GuardEvent};
//! use std::time::Duration;
//!
//! let event = GuardEvent::Call(CallEvent {
//!     service: "geocode".into(),
//!     result: CallResult::Success,
//!     duration: Duration::from_millis(50),
//! });
//! assert_eq!(event.to_string(), "Call::geocode(Success, duration=50ms)");
//! ```

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::{CallEvent, CallResult, GuardEvent, Rejection, TransitionEvent, TransitionReason};
pub use sinks::{
    emit_best_effort, LogSink, MemorySink, NullSink, SplitSink, SplitSinkError, TelemetrySink,
};

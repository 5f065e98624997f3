//! Multi-window token-bucket rate limiting.
//!
//! This module provides the building blocks for admission control:
//! - [`RateLimiter`]: decides whether an `(endpoint, identifier)` pair may make
//!   a request right now, across four windows at once.
//! - [`BucketStore`]: the owned table of token buckets the limiter works on.
//! - [`RateLimitLayer`]: Tower middleware that enforces the limiter.
//! - [`Admission`]: the result of a check (Allowed/Limited).
//!
//! # Windows
//!
//! Every key is limited per second, minute, hour and day. All four buckets
//! refill continuously at `capacity / window_length`, so the per-second bucket
//! refills its whole capacity every second while the day bucket trickles in
//! evenly across the day. There are no calendar-boundary resets.
//!
//! # Atomicity
//!
//! A check refills all four buckets and then either takes one token from each
//! or takes nothing. All of this happens under a single acquisition of the
//! store lock.

use std::fmt;
use std::time::Duration;

pub mod limiter;
pub mod middleware;
pub mod store;

pub use limiter::{RateLimiter, WindowLimits};
pub use middleware::{RateLimitLayer, RateLimitService};
pub use store::{Bucket, BucketKey, BucketStore};

/// One of the four limiting windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(rename_all = "snake_case"))]
pub enum Window {
    /// One second.
    Second,
    /// Sixty seconds.
    Minute,
    /// One hour.
    Hour,
    /// Twenty-four hours.
    Day,
}

impl Window {
    /// All windows, shortest first.
    pub const ALL: [Window; 4] = [Window::Second, Window::Minute, Window::Hour, Window::Day];

    /// Window length in milliseconds.
    pub const fn millis(self) -> u64 {
        match self {
            Window::Second => 1_000,
            Window::Minute => 60_000,
            Window::Hour => 3_600_000,
            Window::Day => 86_400_000,
        }
    }

    /// Window length.
    pub const fn length(self) -> Duration {
        Duration::from_millis(self.millis())
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Window::Second => "second",
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The decision returned by [`RateLimiter::check_and_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed; one token was taken from every window.
    Allowed {
        /// Whole tokens left in the most constrained window.
        remaining: u32,
        /// The most constrained window.
        window: Window,
    },
    /// The request must wait; no tokens were taken.
    Limited {
        /// Whole seconds (at least 1) until the blocking window has a token.
        retry_after_secs: u64,
        /// The exhausted window with the shortest wait.
        window: Window,
    },
}

impl Admission {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }

    /// Remaining tokens for allowed requests.
    pub fn remaining(&self) -> Option<u32> {
        match self {
            Admission::Allowed { remaining, .. } => Some(*remaining),
            Admission::Limited { .. } => None,
        }
    }

    /// Retry hint for limited requests. Useful for `Retry-After` headers.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Admission::Limited { retry_after_secs, .. } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            Admission::Allowed { .. } => None,
        }
    }

    /// The window the decision refers to.
    pub fn window(&self) -> Window {
        match self {
            Admission::Allowed { window, .. } | Admission::Limited { window, .. } => *window,
        }
    }
}

/// Read-only view of one window for an `(endpoint, identifier)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WindowStatus {
    /// Tokens available now, including fractional refill.
    pub tokens: f64,
    /// Bucket capacity.
    pub capacity: u32,
    /// Time until the next whole token; zero when the bucket is full.
    pub next_refill: Duration,
}

/// Which buckets [`RateLimiter::reset`] clears for an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope<'a> {
    /// Only the buckets of one endpoint.
    Endpoint(&'a str),
    /// The buckets of every endpoint.
    All,
}

//! Configuration for an [`ApiGuard`](crate::ApiGuard).
//!
//! A [`GuardConfig`] bundles the per-window capacities, the breaker settings
//! and the sweep intervals. Every part is validated when it is built, so a
//! `GuardConfig` value is always usable as is.
//!
//! ```rust
//! use geoguard::{CircuitBreakerConfig, GuardConfig};
//! use std::time::Duration;
//!
//! let config = GuardConfig::builder()
//!     .per_second(5)
//!     .per_minute(100)
//!     .per_hour(2_000)
//!     .per_day(20_000)
//!     .breaker(
//!         CircuitBreakerConfig::builder()
//!             .failure_threshold(3)
//!             .recovery_timeout(Duration::from_secs(60))
//!             .build()?,
//!     )
//!     .build()?;
//! assert_eq!(config.ticks().refill(), Duration::from_secs(1));
//! # Ok::<(), geoguard::ConfigError>(())
//! ```
//!
//! ## Presets
//!
//! - [`GuardConfig::geocoding`]: forward/reverse geocoding on a free-tier quota
//! - [`GuardConfig::places`]: places search, with a stricter quota and a more
//!   cautious breaker

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::rate_limit::WindowLimits;
use std::time::Duration;

const DEFAULT_REFILL_EVERY_SECS: u64 = 1;
const DEFAULT_RECOVERY_EVERY_SECS: u64 = 5;

const GEOCODING_PER_SECOND: u32 = 10;
const GEOCODING_PER_MINUTE: u32 = 300;
const GEOCODING_PER_HOUR: u32 = 5_000;
const GEOCODING_PER_DAY: u32 = 40_000;
const GEOCODING_FAILURE_THRESHOLD: usize = 5;
const GEOCODING_RECOVERY_SECS: u64 = 30;

const PLACES_PER_SECOND: u32 = 5;
const PLACES_PER_MINUTE: u32 = 100;
const PLACES_PER_HOUR: u32 = 1_000;
const PLACES_PER_DAY: u32 = 10_000;
const PLACES_FAILURE_THRESHOLD: usize = 3;
const PLACES_RECOVERY_SECS: u64 = 60;
const PLACES_SUCCESS_THRESHOLD: usize = 2;
const PLACES_MAX_HALF_OPEN: usize = 1;

/// How often the two background sweeps run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickIntervals {
    refill: Duration,
    recovery: Duration,
}

impl Default for TickIntervals {
    fn default() -> Self {
        Self {
            refill: Duration::from_secs(DEFAULT_REFILL_EVERY_SECS),
            recovery: Duration::from_secs(DEFAULT_RECOVERY_EVERY_SECS),
        }
    }
}

impl TickIntervals {
    /// Both intervals must be > 0.
    pub fn new(refill: Duration, recovery: Duration) -> Result<Self, ConfigError> {
        if refill.is_zero() {
            return Err(ConfigError::ZeroTickInterval { name: "refill" });
        }
        if recovery.is_zero() {
            return Err(ConfigError::ZeroTickInterval { name: "recovery" });
        }
        Ok(Self { refill, recovery })
    }

    /// Bucket refill sweep interval.
    pub fn refill(&self) -> Duration {
        self.refill
    }

    /// Circuit recovery sweep interval.
    pub fn recovery(&self) -> Duration {
        self.recovery
    }
}

/// Complete configuration for an [`ApiGuard`](crate::ApiGuard).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    limits: WindowLimits,
    breaker: CircuitBreakerConfig,
    ticks: TickIntervals,
}

impl GuardConfig {
    /// Assemble a config from already validated parts.
    pub fn new(limits: WindowLimits, breaker: CircuitBreakerConfig, ticks: TickIntervals) -> Self {
        Self { limits, breaker, ticks }
    }

    /// Builder starting from the geocoding quota with the default breaker.
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::default()
    }

    /// Free-tier geocoding quota: 10/s, 300/min, 5 000/h, 40 000/day.
    /// Opens after 5 counted failures and recovers after 30s.
    pub fn geocoding() -> Self {
        let breaker = CircuitBreakerConfig::builder()
            .failure_threshold(GEOCODING_FAILURE_THRESHOLD)
            .recovery_timeout(Duration::from_secs(GEOCODING_RECOVERY_SECS))
            .build()
            .expect("valid breaker config");
        let limits = WindowLimits::new(
            GEOCODING_PER_SECOND,
            GEOCODING_PER_MINUTE,
            GEOCODING_PER_HOUR,
            GEOCODING_PER_DAY,
        )
        .expect("valid limits config");
        Self::new(limits, breaker, TickIntervals::default())
    }

    /// Places search quota: 5/s, 100/min, 1 000/h, 10 000/day.
    /// Opens after 3 counted failures, recovers after 60s and sends a
    /// single trial call at a time.
    pub fn places() -> Self {
        let breaker = CircuitBreakerConfig::builder()
            .failure_threshold(PLACES_FAILURE_THRESHOLD)
            .recovery_timeout(Duration::from_secs(PLACES_RECOVERY_SECS))
            .success_threshold(PLACES_SUCCESS_THRESHOLD)
            .max_half_open_requests(PLACES_MAX_HALF_OPEN)
            .build()
            .expect("valid breaker config");
        let limits =
            WindowLimits::new(PLACES_PER_SECOND, PLACES_PER_MINUTE, PLACES_PER_HOUR, PLACES_PER_DAY)
                .expect("valid limits config");
        Self::new(limits, breaker, TickIntervals::default())
    }

    /// Per-window request limits.
    pub fn limits(&self) -> &WindowLimits {
        &self.limits
    }

    pub fn breaker(&self) -> &CircuitBreakerConfig {
        &self.breaker
    }

    /// Sweep intervals.
    pub fn ticks(&self) -> &TickIntervals {
        &self.ticks
    }
}

/// Builder for [`GuardConfig`]. Starts from the geocoding capacities and the
/// default breaker.
#[derive(Debug, Clone)]
pub struct GuardConfigBuilder {
    per_second: u32,
    per_minute: u32,
    per_hour: u32,
    per_day: u32,
    breaker: CircuitBreakerConfig,
    refill_every: Duration,
    recovery_every: Duration,
}

impl Default for GuardConfigBuilder {
    fn default() -> Self {
        let ticks = TickIntervals::default();
        Self {
            per_second: GEOCODING_PER_SECOND,
            per_minute: GEOCODING_PER_MINUTE,
            per_hour: GEOCODING_PER_HOUR,
            per_day: GEOCODING_PER_DAY,
            breaker: CircuitBreakerConfig::default(),
            refill_every: ticks.refill,
            recovery_every: ticks.recovery,
        }
    }
}

impl GuardConfigBuilder {
    /// Requests per second for each `(endpoint, identifier)` pair.
    pub fn per_second(mut self, n: u32) -> Self {
        self.per_second = n;
        self
    }

    /// Requests per minute.
    pub fn per_minute(mut self, n: u32) -> Self {
        self.per_minute = n;
        self
    }

    /// Requests per hour.
    pub fn per_hour(mut self, n: u32) -> Self {
        self.per_hour = n;
        self
    }

    /// Requests per day.
    pub fn per_day(mut self, n: u32) -> Self {
        self.per_day = n;
        self
    }

    /// Circuit breaker settings, already validated.
    pub fn breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Interval of the background refill sweep.
    pub fn refill_every(mut self, every: Duration) -> Self {
        self.refill_every = every;
        self
    }

    /// Interval of the background recovery sweep.
    pub fn recovery_every(mut self, every: Duration) -> Self {
        self.recovery_every = every;
        self
    }

    /// Validate the limits and tick intervals.
    pub fn build(self) -> Result<GuardConfig, ConfigError> {
        let limits = WindowLimits::new(self.per_second, self.per_minute, self.per_hour, self.per_day)?;
        let ticks = TickIntervals::new(self.refill_every, self.recovery_every)?;
        Ok(GuardConfig::new(limits, self.breaker, ticks))
    }
}

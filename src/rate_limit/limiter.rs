use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, SchedulerError};
use crate::rate_limit::store::{Bucket, BucketKey, BucketStore, Heal};
use crate::rate_limit::{Admission, ResetScope, Window, WindowStatus};
use crate::scheduler::{Scheduler, TickHandle};
use futures::FutureExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Validated per-window capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    per_second: u32,
    per_minute: u32,
    per_hour: u32,
    per_day: u32,
}

impl WindowLimits {
    /// Create limits; every capacity must be > 0.
    pub fn new(
        per_second: u32,
        per_minute: u32,
        per_hour: u32,
        per_day: u32,
    ) -> Result<Self, ConfigError> {
        let limits = Self { per_second, per_minute, per_hour, per_day };
        for window in Window::ALL {
            if limits.capacity(window) == 0 {
                return Err(ConfigError::ZeroCapacity { window });
            }
        }
        Ok(limits)
    }

    /// Capacity of one window.
    pub fn capacity(&self, window: Window) -> u32 {
        match window {
            Window::Second => self.per_second,
            Window::Minute => self.per_minute,
            Window::Hour => self.per_hour,
            Window::Day => self.per_day,
        }
    }
}

/// Admission control across four windows for `(endpoint, identifier)` pairs.
///
/// Clones share the same [`BucketStore`]. Use [`RateLimiter::with_store`] to
/// inject a store, or build separate limiters for isolated state.
///
/// Checks never fail: they return either [`Admission::Allowed`] or
/// [`Admission::Limited`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: BucketStore,
    limits: WindowLimits,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Limiter with its own store and a monotonic clock.
    pub fn new(limits: WindowLimits) -> Self {
        Self { store: BucketStore::new(), limits, clock: Arc::new(MonotonicClock::default()) }
    }

    /// Use `store` instead of the limiter's own.
    pub fn with_store(mut self, store: BucketStore) -> Self {
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

    /// Configured capacities.
    pub fn limits(&self) -> &WindowLimits {
        &self.limits
    }

    /// The backing store.
    pub fn store(&self) -> &BucketStore {
        &self.store
    }

    /// Admit one request if every window has a token.
    ///
    /// On admission one token is taken from each window and the smallest
    /// remaining count is reported. If any window is empty nothing is taken
    /// and the shortest wait among the empty windows is reported.
    pub fn check_and_consume(&self, endpoint: &str, identifier: &str) -> Admission {
        let now = self.clock.now_millis();
        let keys = Window::ALL.map(|window| BucketKey::new(endpoint, identifier, window));
        let mut table = self.store.lock();

        let mut blocked: Option<(u64, Window)> = None;
        for key in &keys {
            let capacity = self.limits.capacity(key.window);
            let bucket =
                table.entry(key.clone()).or_insert_with(|| Bucket::full(key.window, capacity, now));
            if let Some(heal) = bucket.refill(now) {
                log_heal(key, heal);
            }
            if bucket.tokens < 1.0 {
                let wait = bucket.retry_after_secs();
                if blocked.map_or(true, |(best, _)| wait < best) {
                    blocked = Some((wait, key.window));
                }
            }
        }

        if let Some((retry_after_secs, window)) = blocked {
            debug!(endpoint, identifier, %window, retry_after_secs, "rate limited");
            return Admission::Limited { retry_after_secs, window };
        }

        let mut tightest = (u32::MAX, Window::Second);
        for key in &keys {
            if let Some(bucket) = table.get_mut(key) {
                bucket.tokens = (bucket.tokens - 1.0).max(0.0);
                let remaining = bucket.tokens.floor() as u32;
                if remaining < tightest.0 {
                    tightest = (remaining, key.window);
                }
            }
        }

        let (remaining, window) = tightest;
        debug!(endpoint, identifier, remaining, %window, "request admitted");
        Admission::Allowed { remaining, window }
    }

    /// Per-window view for one pair. Never mutates or creates buckets.
    pub fn get_status(&self, endpoint: &str, identifier: &str) -> BTreeMap<Window, WindowStatus> {
        let now = self.clock.now_millis();
        let table = self.store.lock();
        Window::ALL
            .into_iter()
            .map(|window| {
                let capacity = self.limits.capacity(window);
                let key = BucketKey::new(endpoint, identifier, window);
                let mut view = table
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| Bucket::full(window, capacity, now));
                if let Some(heal) = view.refill(now) {
                    log_heal(&key, heal);
                }
                let next_refill = if view.tokens >= f64::from(view.capacity) {
                    Duration::ZERO
                } else {
                    let next_whole = view.tokens.floor() + 1.0;
                    Duration::from_millis(view.millis_until(next_whole))
                };
                (window, WindowStatus { tokens: view.tokens, capacity: view.capacity, next_refill })
            })
            .collect()
    }

    /// Drop the buckets of `identifier`, for one endpoint or all of them.
    /// Returns the number of buckets removed.
    pub fn reset(&self, scope: ResetScope<'_>, identifier: &str) -> usize {
        let removed = self.store.remove_where(|key| {
            key.identifier == identifier
                && match scope {
                    ResetScope::Endpoint(endpoint) => key.endpoint == endpoint,
                    ResetScope::All => true,
                }
        });
        info!(identifier, ?scope, removed, "rate limit buckets reset");
        removed
    }

    /// Drop every bucket.
    pub fn reset_all(&self) -> usize {
        let removed = self.store.clear();
        info!(removed, "all rate limit buckets reset");
        removed
    }

    /// Refill every tracked bucket to now. Returns the number of buckets visited.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut table = self.store.lock();
        for (key, bucket) in table.iter_mut() {
            if let Some(heal) = bucket.refill(now) {
                log_heal(key, heal);
            }
        }
        table.len()
    }

    /// Number of tracked buckets.
    pub fn tracked_buckets(&self) -> usize {
        self.store.len()
    }

    /// Run [`RateLimiter::sweep`] every `every` on `scheduler`.
    pub fn start(
        &self,
        scheduler: &dyn Scheduler,
        every: Duration,
    ) -> Result<TickHandle, SchedulerError> {
        let limiter = self.clone();
        scheduler.schedule(
            "rate_limit_refill",
            every,
            Arc::new(move || {
                let visited = limiter.sweep();
                tracing::trace!(visited, "refill sweep");
                futures::future::ready(()).boxed()
            }),
        )
    }
}

fn log_heal(key: &BucketKey, heal: Heal) {
    warn!(
        target: "geoguard::rate_limit",
        endpoint = %key.endpoint,
        identifier = %key.identifier,
        window = %key.window,
        ?heal,
        "repaired corrupted bucket state"
    );
}

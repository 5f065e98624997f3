use crate::rate_limit::Window;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Identifies one token bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketKey {
    /// Upstream endpoint, e.g. `"geocode"` or `"places/nearby"`.
    pub endpoint: String,
    /// Caller identity the quota is tracked for (API key, user, tenant).
    pub identifier: String,
    /// Window this bucket limits.
    pub window: Window,
}

impl BucketKey {
    /// Key for the `window` bucket of one `(endpoint, identifier)` pair.
    ///
    /// ```rust
    /// use geoguard::rate_limit::store::BucketKey;
    /// use geoguard::Window;
    ///
    /// let key = BucketKey::new("geocode", "api-key", Window::Minute);
    /// assert_eq!(key.endpoint, "geocode");
    /// assert_eq!(key.window, Window::Minute);
    /// ```
    pub fn new(endpoint: &str, identifier: &str, window: Window) -> Self {
        Self { endpoint: endpoint.to_owned(), identifier: identifier.to_owned(), window }
    }
}

/// What [`Bucket::refill`] had to repair before refilling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heal {
    /// `last_refill` was ahead of the clock; it was treated as "now".
    FutureTimestamp,
    /// `tokens` was NaN or outside `[0, capacity]`; it was clamped.
    TokensOutOfRange,
}

/// A single token bucket.
///
/// Tokens are fractional so slow windows (a day bucket gains one token every
/// few minutes) accumulate refill between accesses.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Tokens available, `0 ≤ tokens ≤ capacity` after every refill.
    pub tokens: f64,
    /// Maximum tokens.
    pub capacity: u32,
    /// Clock millis of the last refill.
    pub last_refill: u64,
    /// Window the bucket refills over.
    pub window: Window,
}

impl Bucket {
    /// A full bucket, last refilled at `now`.
    pub fn full(window: Window, capacity: u32, now: u64) -> Self {
        Self { tokens: f64::from(capacity), capacity, last_refill: now, window }
    }

    /// Tokens gained per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.capacity) / self.window.length().as_secs_f64()
    }

    /// Bring the bucket up to `now`.
    ///
    /// Corrupted state is repaired rather than rejected: a timestamp from the
    /// future is treated as `now` (no refill this time), and a token count
    /// outside the valid range is clamped (NaN becomes 0).
    pub fn refill(&mut self, now: u64) -> Option<Heal> {
        let mut healed = None;
        let capacity = f64::from(self.capacity);

        if self.tokens.is_nan() {
            self.tokens = 0.0;
            healed = Some(Heal::TokensOutOfRange);
        } else if !(0.0..=capacity).contains(&self.tokens) {
            self.tokens = self.tokens.clamp(0.0, capacity);
            healed = Some(Heal::TokensOutOfRange);
        }

        if self.last_refill > now {
            self.last_refill = now;
            return Some(Heal::FutureTimestamp);
        }

        let elapsed = now - self.last_refill;
        let window_ms = self.window.millis();
        self.tokens = if elapsed >= window_ms {
            capacity
        } else {
            // multiply before dividing so a full window lands exactly on capacity
            let gained = (elapsed as f64 * capacity) / window_ms as f64;
            (self.tokens + gained).min(capacity)
        };
        self.last_refill = now;
        healed
    }

    /// Whole seconds (at least 1) until one token is available.
    pub fn retry_after_secs(&self) -> u64 {
        let wait_ms = self.millis_until(1.0);
        ((wait_ms + 999) / 1_000).max(1)
    }

    /// Millis until the bucket holds at least `target` tokens.
    pub fn millis_until(&self, target: f64) -> u64 {
        let missing = target - self.tokens;
        if missing <= 0.0 || self.capacity == 0 {
            return 0;
        }
        let ms = (missing * self.window.millis() as f64 / f64::from(self.capacity)).ceil();
        ms as u64
    }
}

/// Owned, cloneable handle to a table of token buckets.
///
/// Clones share the same table. All access goes through one mutex, which is
/// what makes refill-then-consume atomic across the four windows of a key.
/// Independent limiters get independent stores.
#[derive(Debug, Clone, Default)]
pub struct BucketStore {
    inner: Arc<Mutex<HashMap<BucketKey, Bucket>>>,
}

impl BucketStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the table. A poisoned lock is recovered: bucket state is plain
    /// data and every entry self-heals on its next refill.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<BucketKey, Bucket>> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!(target: "geoguard::rate_limit", "bucket store lock was poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Copy of one bucket, as stored (not refilled).
    pub fn get(&self, key: &BucketKey) -> Option<Bucket> {
        self.lock().get(key).cloned()
    }

    /// Insert or replace a bucket, returning the previous one.
    pub fn insert(&self, key: BucketKey, bucket: Bucket) -> Option<Bucket> {
        self.lock().insert(key, bucket)
    }

    /// Remove every bucket matching `pred`, returning how many were removed.
    pub fn remove_where<F>(&self, mut pred: F) -> usize
    where
        F: FnMut(&BucketKey) -> bool,
    {
        let mut table = self.lock();
        let before = table.len();
        table.retain(|key, _| !pred(key));
        before - table.len()
    }

    /// Remove every bucket.
    pub fn clear(&self) -> usize {
        let mut table = self.lock();
        let removed = table.len();
        table.clear();
        removed
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no bucket is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Tracked keys, sorted.
    pub fn keys(&self) -> Vec<BucketKey> {
        let mut keys: Vec<BucketKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

//! Abstraction for periodic ticks.
//!
//! Background sweeps (bucket refill, circuit recovery) register a callback with
//! a [`Scheduler`] instead of owning their own timers. Production code uses
//! [`TokioScheduler`]; tests use [`ManualScheduler`] and fire ticks by hand,
//! together with [`crate::clock::ManualClock`], so nothing waits on wall-clock
//! time.

use crate::error::SchedulerError;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// Callback invoked on every tick.
pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Something that can invoke a callback every `every`.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Register `tick` to run every `every`, starting one interval from now.
    /// Ticking stops when the returned handle is dropped.
    fn schedule(
        &self,
        name: &'static str,
        every: Duration,
        tick: TickFn,
    ) -> Result<TickHandle, SchedulerError>;
}

/// Keeps a scheduled tick alive. Dropping the handle cancels it.
#[derive(Debug)]
pub struct TickHandle {
    name: &'static str,
    active: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TickHandle {
    /// Name the tick was registered under.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the tick is still scheduled.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop ticking. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for TickHandle {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Production scheduler backed by `tokio::time::interval`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(
        &self,
        name: &'static str,
        every: Duration,
        tick: TickFn,
    ) -> Result<TickHandle, SchedulerError> {
        if every.is_zero() {
            return Err(SchedulerError::ZeroInterval { name });
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SchedulerError::NoRuntime { name })?;

        let active = Arc::new(AtomicBool::new(true));
        let flag = active.clone();
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if !flag.load(Ordering::Acquire) {
                    break;
                }
                tick().await;
            }
        });

        tracing::debug!(name, every_ms = every.as_millis() as u64, "tick scheduled");
        Ok(TickHandle { name, active, task: Some(task) })
    }
}

struct ManualEntry {
    name: &'static str,
    every: Duration,
    tick: TickFn,
    active: Arc<AtomicBool>,
}

impl fmt::Debug for ManualEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualEntry")
            .field("name", &self.name)
            .field("every", &self.every)
            .field("active", &self.active.load(Ordering::Acquire))
            .finish()
    }
}

/// Test scheduler that only ticks when told to.
///
/// Clones share registrations, so a test can keep one handle while the code
/// under test registers through another.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every active tick registered under `name`; returns how many ran.
    pub async fn fire(&self, name: &str) -> usize {
        self.run_matching(|entry| entry.name == name).await
    }

    /// Run every active tick; returns how many ran.
    pub async fn fire_all(&self) -> usize {
        self.run_matching(|_| true).await
    }

    /// Active registrations as `(name, interval)`.
    pub fn registered(&self) -> Vec<(&'static str, Duration)> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|entry| entry.active.load(Ordering::Acquire));
        entries.iter().map(|entry| (entry.name, entry.every)).collect()
    }

    async fn run_matching<P>(&self, pred: P) -> usize
    where
        P: Fn(&ManualEntry) -> bool,
    {
        let ticks: Vec<TickFn> = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.retain(|entry| entry.active.load(Ordering::Acquire));
            entries.iter().filter(|entry| pred(entry)).map(|entry| entry.tick.clone()).collect()
        };
        for tick in &ticks {
            tick().await;
        }
        ticks.len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(
        &self,
        name: &'static str,
        every: Duration,
        tick: TickFn,
    ) -> Result<TickHandle, SchedulerError> {
        if every.is_zero() {
            return Err(SchedulerError::ZeroInterval { name });
        }
        let active = Arc::new(AtomicBool::new(true));
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(ManualEntry {
            name,
            every,
            tick,
            active: active.clone(),
        });
        Ok(TickHandle { name, active, task: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn counting_tick(counter: Arc<AtomicUsize>) -> TickFn {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(()).boxed()
        })
    }

    #[tokio::test]
    async fn manual_scheduler_fires_on_demand() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let _handle = scheduler
            .schedule("refill", Duration::from_secs(1), counting_tick(counter.clone()))
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.fire("refill").await, 1);
        assert_eq!(scheduler.fire("recovery").await, 0);
        assert_eq!(scheduler.fire_all().await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.registered(), vec![("refill", Duration::from_secs(1))]);
    }

    #[tokio::test]
    async fn dropping_handle_unregisters() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = scheduler
            .schedule("recovery", Duration::from_secs(5), counting_tick(counter.clone()))
            .unwrap();
        assert!(handle.is_active());
        handle.cancel();

        assert_eq!(scheduler.fire_all().await, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(scheduler.registered().is_empty());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = ManualScheduler::new()
            .schedule("refill", Duration::ZERO, counting_tick(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();
        assert_eq!(err, SchedulerError::ZeroInterval { name: "refill" });
    }

    #[test]
    fn tokio_scheduler_requires_runtime() {
        let err = TokioScheduler
            .schedule("refill", Duration::from_secs(1), counting_tick(Arc::new(AtomicUsize::new(0))))
            .unwrap_err();
        assert_eq!(err, SchedulerError::NoRuntime { name: "refill" });
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_ticks_every_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = TokioScheduler
            .schedule("refill", Duration::from_millis(100), counting_tick(counter.clone()))
            .unwrap();
        assert_eq!(handle.name(), "refill");

        tokio::time::sleep(Duration::from_millis(350)).await;
        let ticks = counter.load(Ordering::SeqCst);
        assert!((3..=4).contains(&ticks), "expected ~3 ticks, got {ticks}");

        drop(handle);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), ticks, "ticks continued after cancel");
    }
}

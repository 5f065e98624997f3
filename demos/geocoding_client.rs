//! Geocoding client behind a guard: quota, outage, fallback, recovery.
use geoguard::prelude::*;
use geoguard::telemetry::{CallResult, LogSink, MemorySink, SplitSink};
use geoguard::CircuitBreakerConfig as BreakerConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pretend upstream that is down for requests 3 through 7.
async fn geocode(requests: Arc<AtomicUsize>, address: &str) -> Result<(f64, f64), ApiError> {
    let n = requests.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(5)).await;
    if (3..8).contains(&n) {
        return Err(ApiError::status(503, "service unavailable"));
    }
    if address.is_empty() {
        return Err(ApiError::status(400, "empty address"));
    }
    Ok((18.4655, -66.1057))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = GuardConfig::builder()
        .per_second(20)
        .breaker(
            BreakerConfig::builder()
                .failure_threshold(3)
                .recovery_timeout(Duration::from_millis(500))
                .success_threshold(2)
                .build()?,
        )
        .recovery_every(Duration::from_millis(100))
        .build()?;
    // transitions go to the log; per-call events stay in a small buffer
    let recent_calls = MemorySink::with_capacity(64);
    let guard = ApiGuard::new(config).with_sink(SplitSink::new(LogSink, recent_calls.clone()));
    let _sweeps = guard.start(&TokioScheduler)?;

    let requests = Arc::new(AtomicUsize::new(0));
    for round in 0..16 {
        let requests = requests.clone();
        let outcome = guard
            .execute_with_fallback(
                "geocode",
                "demo-key",
                move || geocode(requests, "Calle Fortaleza, San Juan"),
                |reason| {
                    println!("  fallback after: {reason}");
                    async { Ok((0.0, 0.0)) }
                },
            )
            .await;

        match outcome {
            GuardOutcome::Limited { retry_after_secs, window } => {
                println!("round {round}: limited by {window}, retry in {retry_after_secs}s")
            }
            GuardOutcome::Completed(call) => {
                let state = guard.breaker().get_state("geocode").status;
                println!("round {round}: {:?} (circuit {state})", call.value());
            }
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    let failed = recent_calls
        .calls()
        .iter()
        .filter(|call| matches!(call.result, CallResult::Failure { .. }))
        .count();
    println!("{} call events buffered, {} failed", recent_calls.len(), failed);
    println!("{:#?}", guard.health());
    Ok(())
}

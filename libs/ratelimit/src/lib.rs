//! Rate limiting primitives: the process-wide token bucket shared by every
//! synthesis worker, and the engine-local actions-per-second window.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::gauge;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

use guildsmith_telemetry::names;

/// One grant costs one token.
const TOKEN: f64 = 1.0;
/// Refill granularity; keeps the refill monotonic under clock reads.
const TICK_MS: u64 = 100;

/// Returned by a cancelled [`TokenBucket::acquire`] wait.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("rate limit wait cancelled")]
pub struct AcquireCancelled;

/// Non-blocking probe result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Probe {
    pub granted: bool,
    /// Time until one token would be available; zero when granted.
    pub wait: Duration,
}

/// Snapshot for stats and the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStatus {
    pub capacity: f64,
    pub available: f64,
    pub refill_rate: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Process-wide token bucket: `capacity` burst, `refill_rate` tokens/sec
/// steady state. One instance is shared by reference across all job types and
/// workers; per-operation limits apply in addition, not instead.
///
/// Waiters poll on a short sleep, so fairness is FIFO-approximate: tasks are
/// rescheduled roughly in arrival order but no strict queue is kept.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            refill_rate: refill_rate.max(0.1),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(state: &mut BucketState, capacity: f64, refill_rate: f64) {
        let elapsed = state.last_refill.elapsed();
        let ticks = elapsed.as_millis() as u64 / TICK_MS;
        if ticks == 0 {
            return;
        }
        let refill = ticks as f64 * (refill_rate * (TICK_MS as f64 / 1000.0));
        state.tokens = (state.tokens + refill).min(capacity);
        state.last_refill += Duration::from_millis(ticks * TICK_MS);
    }

    fn wait_for_one(&self, tokens: f64) -> Duration {
        let missing = (TOKEN - tokens).max(0.0);
        Duration::from_secs_f64(missing / self.refill_rate)
    }

    /// Attempts to take one token without suspending.
    pub fn probe(&self) -> Probe {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        Self::refill(&mut state, self.capacity, self.refill_rate);
        if state.tokens >= TOKEN {
            state.tokens -= TOKEN;
            gauge!(names::TOKEN_BUCKET_AVAILABLE).set(state.tokens);
            return Probe {
                granted: true,
                wait: Duration::ZERO,
            };
        }
        Probe {
            granted: false,
            wait: self.wait_for_one(state.tokens),
        }
    }

    /// Suspends until a token is granted or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireCancelled> {
        loop {
            let probe = self.probe();
            if probe.granted {
                return Ok(());
            }
            if probe.wait > Duration::from_secs(1) {
                event!(
                    Level::INFO,
                    wait_ms = probe.wait.as_millis() as u64,
                    "token bucket exhausted, waiting"
                );
            }
            let wait = probe.wait.max(Duration::from_millis(TICK_MS));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => return Err(AcquireCancelled),
            }
        }
    }

    pub fn status(&self) -> BucketStatus {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        Self::refill(&mut state, self.capacity, self.refill_rate);
        BucketStatus {
            capacity: self.capacity,
            available: state.tokens,
            refill_rate: self.refill_rate,
        }
    }
}

/// Fixed one-second window limiter shared by the engine worker pool. Protects
/// the platform API even when the global bucket is over-provisioned.
#[derive(Debug)]
pub struct OpsPerSecond {
    max: u32,
    state: Mutex<WindowState>,
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl OpsPerSecond {
    pub fn new(max: u32) -> Self {
        Self {
            max: max.max(1),
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// `Ok` consumes one slot; `Err` carries the remainder of the window.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(|err| err.into_inner());
        let elapsed = state.window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            state.window_start = Instant::now();
            state.count = 0;
        }
        if state.count < self.max {
            state.count += 1;
            return Ok(());
        }
        Err(Duration::from_secs(1).saturating_sub(elapsed))
    }

    /// Suspends through window rollovers until a slot frees up.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireCancelled> {
        loop {
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let wait = wait.max(Duration::from_millis(10));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return Err(AcquireCancelled),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_grants_up_to_burst_then_reports_wait() {
        let bucket = TokenBucket::new(3.0, 10.0);
        for _ in 0..3 {
            assert!(bucket.probe().granted);
        }
        let probe = bucket.probe();
        assert!(!probe.granted);
        assert!(probe.wait > Duration::ZERO);
        assert!(probe.wait <= Duration::from_millis(150));
    }

    #[test]
    fn available_never_exceeds_capacity() {
        let bucket = TokenBucket::new(2.0, 1000.0);
        std::thread::sleep(Duration::from_millis(250));
        let status = bucket.status();
        assert!(status.available <= status.capacity);
        assert!(status.available >= 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn acquire_waits_for_refill() {
        let bucket = TokenBucket::new(1.0, 10.0);
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();

        let started = Instant::now();
        bucket.acquire(&cancel).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn cancelled_acquire_errors() {
        let bucket = TokenBucket::new(1.0, 0.1);
        let cancel = CancellationToken::new();
        bucket.acquire(&cancel).await.unwrap();
        cancel.cancel();
        assert_eq!(bucket.acquire(&cancel).await, Err(AcquireCancelled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_drain_respects_refill_rate() {
        // 5 burst tokens + 50/s refill: 20 grants need ~0.3s of refill.
        let bucket = std::sync::Arc::new(TokenBucket::new(5.0, 50.0));
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let bucket = bucket.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                bucket.acquire(&cancel).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(250), "elapsed {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "elapsed {elapsed:?}");
    }

    #[test]
    fn window_limiter_caps_within_one_second() {
        let limiter = OpsPerSecond::new(3);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        let wait = limiter.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn window_limiter_resets_after_rollover() {
        let limiter = OpsPerSecond::new(1);
        assert!(limiter.try_acquire().is_ok());
        {
            let mut state = limiter.state.lock().unwrap();
            state.window_start = Instant::now() - Duration::from_millis(1100);
        }
        assert!(limiter.try_acquire().is_ok());
    }
}

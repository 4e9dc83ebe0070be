//! Rate-limited retry scheduling for failed syncs.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::mpsc, time::Instant};
use tracing::debug;

const BACKOFF_BASE: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const BUCKET_RATE: f64 = 10.0;
const BUCKET_BURST: f64 = 100.0;

/// Exponential backoff: 5ms, 10ms, 20ms, … capped at 30s. Each call to
/// [`ExponentialBackoff::next_delay`] counts as a failure.
struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ExponentialBackoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(1u32.checked_shl(self.failures).unwrap_or(u32::MAX))
            .min(self.max);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Token bucket reserving one token per call; callers wait for the returned
/// delay when the bucket is exhausted.
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

/// The limiter governing sync retries: the max of an exponential backoff and
/// a token bucket, so retries back off under persistent failure and are
/// bounded in aggregate even when backoff is repeatedly reset by successes.
pub struct SyncRateLimiter {
    backoff: ExponentialBackoff,
    bucket: TokenBucket,
}

impl SyncRateLimiter {
    pub fn new() -> Self {
        Self {
            backoff: ExponentialBackoff::new(BACKOFF_BASE, BACKOFF_MAX),
            bucket: TokenBucket::new(BUCKET_RATE, BUCKET_BURST),
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.backoff.next_delay().max(self.bucket.next_delay())
    }

    pub fn forget(&mut self) {
        self.backoff.reset();
    }
}

/// Schedules at most one pending retry at a time. When the retry timer pops,
/// the sync channel is kicked and the pending slot frees up.
pub struct RetryController {
    limiter: SyncRateLimiter,
    pending: Arc<AtomicBool>,
    sync_tx: mpsc::Sender<()>,
}

impl RetryController {
    pub fn new(sync_tx: mpsc::Sender<()>) -> Self {
        Self {
            limiter: SyncRateLimiter::new(),
            pending: Arc::new(AtomicBool::new(false)),
            sync_tx,
        }
    }

    /// Arms the retry timer unless one is already pending.
    pub fn schedule_retry(&mut self) {
        if self.pending.swap(true, Ordering::SeqCst) {
            debug!(
                event.name = "ipam.retry_pending",
                "retry already scheduled, not scheduling another"
            );
            return;
        }
        let delay = self.limiter.next_delay();
        debug!(
            event.name = "ipam.retry_scheduled",
            delay_ms = delay.as_millis() as u64,
            "scheduling sync retry"
        );
        let pending = self.pending.clone();
        let sync_tx = self.sync_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::SeqCst);
            let _ = sync_tx.try_send(());
        });
    }

    /// Resets the backoff after a successful sync.
    pub fn success(&mut self) {
        self.limiter.forget();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_and_caps() {
        let mut b = ExponentialBackoff::new(BACKOFF_BASE, BACKOFF_MAX);
        assert_eq!(b.next_delay(), Duration::from_millis(5));
        assert_eq!(b.next_delay(), Duration::from_millis(10));
        assert_eq!(b.next_delay(), Duration::from_millis(20));
        for _ in 0..20 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), BACKOFF_MAX);

        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_delays_after_burst() {
        let mut bucket = TokenBucket::new(BUCKET_RATE, BUCKET_BURST);
        for _ in 0..100 {
            assert_eq!(bucket.next_delay(), Duration::ZERO);
        }
        let delay = bucket.next_delay();
        assert!(delay > Duration::ZERO);
        assert!(delay <= Duration::from_millis(100));

        // Refill restores roughly one token per 100ms.
        tokio::time::advance(Duration::from_secs(1)).await;
        let mut zero = 0;
        for _ in 0..20 {
            if bucket.next_delay() == Duration::ZERO {
                zero += 1;
            }
        }
        assert!(zero <= 10);
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_takes_the_max() {
        let mut rl = SyncRateLimiter::new();
        // Bucket is full, so early delays come from the backoff alone.
        assert_eq!(rl.next_delay(), Duration::from_millis(5));
        assert_eq!(rl.next_delay(), Duration::from_millis(10));
        rl.forget();
        assert_eq!(rl.next_delay(), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_pending_retry() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut rc = RetryController::new(tx);

        rc.schedule_retry();
        rc.schedule_retry();
        rc.schedule_retry();

        tokio::time::advance(Duration::from_secs(31)).await;
        // Let the spawned timer task run.
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // The pending slot is free again after the timer popped.
        rc.schedule_retry();
        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_ok());
    }
}

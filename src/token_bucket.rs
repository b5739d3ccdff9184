//! Token-bucket pacing for the send path.
//!
//! Each send worker owns one bucket configured with its per-stream byte
//! rate. After every successful write the worker reports its cumulative
//! byte count; when the stream is ahead of `rate × elapsed` the bucket
//! sleeps long enough to drain the excess, never longer than
//! [`MAX_PACING_SLEEP`]. The ceiling keeps the shared test deadline
//! responsive even when the process was preempted or the rate target is
//! tiny.

use std::time::{Duration, Instant};
use tokio::time;

/// Upper bound on a single pacing sleep.
pub const MAX_PACING_SLEEP: Duration = Duration::from_millis(100);

/// Paces one data stream against a bytes-per-second target.
///
/// # Examples
///
/// ```
/// use netgauge::token_bucket::TokenBucket;
///
/// # async fn example() {
/// // 100 Mbit/s on a single stream = 12_500_000 bytes/s.
/// let mut bucket = TokenBucket::new(12_500_000.0);
/// let mut sent = 0u64;
/// sent += 65_536;
/// bucket.throttle(sent).await;
/// # }
/// ```
#[derive(Debug)]
pub struct TokenBucket {
    /// Target bytes per second for this stream.
    target_bytes_per_sec: f64,
    /// When the test phase started; elapsed time is measured from here.
    started: Instant,
}

impl TokenBucket {
    /// Creates a bucket for the given per-stream rate.
    ///
    /// A rate of zero (or below) disables pacing entirely.
    pub fn new(target_bytes_per_sec: f64) -> Self {
        Self {
            target_bytes_per_sec,
            started: Instant::now(),
        }
    }

    /// Sleeps if the stream is ahead of its rate target.
    ///
    /// `total_bytes` is the cumulative byte count for the stream since the
    /// bucket was created. The sleep duration is the time needed for the
    /// target rate to absorb the excess, clamped to [`MAX_PACING_SLEEP`].
    pub async fn throttle(&mut self, total_bytes: u64) {
        if let Some(sleep) = self.excess_sleep(total_bytes, Instant::now()) {
            time::sleep(sleep).await;
        }
    }

    /// Pacing decision, separated from the clock and the sleep for testing.
    fn excess_sleep(&self, total_bytes: u64, now: Instant) -> Option<Duration> {
        if self.target_bytes_per_sec <= 0.0 {
            return None;
        }

        let elapsed = now.duration_since(self.started).as_secs_f64();
        let expected_bytes = self.target_bytes_per_sec * elapsed;
        let actual_bytes = total_bytes as f64;

        if actual_bytes <= expected_bytes {
            return None;
        }

        let excess = actual_bytes - expected_bytes;
        let sleep = Duration::from_secs_f64(excess / self.target_bytes_per_sec);
        Some(sleep.min(MAX_PACING_SLEEP))
    }
}

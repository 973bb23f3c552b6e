//! Retry with exponential backoff and jitter.
//!
//! Chunk jobs run under this policy in parallel mode: transient transport
//! failures back off and retry; a chunk that exhausts its attempts is left
//! for a later run to resume via the fingerprint probe.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

pub const MAX_ATTEMPTS: u32 = 10;
pub const INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60);
pub const MAX_JITTER: Duration = Duration::from_millis(20);

/// Exponential backoff schedule. Yields `None` once attempts are exhausted.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    delay: Duration,
    cap: Duration,
    max_jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            attempt: 0,
            max_attempts: MAX_ATTEMPTS,
            delay: INITIAL_DELAY,
            cap: MAX_DELAY,
            max_jitter: MAX_JITTER,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, or `None` when the budget is spent.
    /// The first call accounts for the attempt that already failed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            return None;
        }
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..=self.max_jitter);
        let delay = self.delay + jitter;
        self.delay = (self.delay * 2).min(self.cap);
        Some(delay)
    }
}

/// Runs `job` until it succeeds or the backoff budget is exhausted, in which
/// case the last error is returned.
pub async fn retry<T, F, Fut>(mut job: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = Backoff::default();
    loop {
        match job().await {
            Ok(value) => return Ok(value),
            Err(err) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            },
        }
    }
}

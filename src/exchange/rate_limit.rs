// =============================================================================
// Token-bucket rate limiter — single serialized admission point gating every
// REST call made through an ExchangeClient.
// =============================================================================

use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::trace;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Refills at `max_requests_per_second` tokens/sec, burst capped at the same
/// value (a 1-second sliding window).
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(max_requests_per_second: u32) -> Self {
        let capacity = max_requests_per_second.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
                }
            };

            match wait {
                None => return,
                Some(d) => {
                    trace!(wait_ms = d.as_millis() as u64, "rate limiter suspending caller");
                    tokio::time::sleep(d).await;
                }
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn does_not_block_within_capacity() {
        let limiter = RateLimiter::new(8);
        let start = Instant::now();
        for _ in 0..8 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn blocks_once_capacity_exhausted() {
        let limiter = RateLimiter::new(2);
        limiter.acquire().await;
        limiter.acquire().await;
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }
}

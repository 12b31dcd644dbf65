//! # Token-Bucket Rate Limiter
//!
//! An async token bucket used in two roles by the reader:
//!
//! - The **global** limiter, owned by the client and shared (via `Arc`) by
//!   every reader it creates, caps the total number of polling queries per
//!   second across the whole client.
//! - The **adaptive** limiter, owned by a single reader, is retuned on the
//!   fly by the rate-control loop to balance poll frequency against fact
//!   latency.
//!
//! The bucket refills continuously at `rate` tokens per second up to `burst`
//! tokens; each [`RateLimiter::acquire`] call consumes one token, sleeping
//! until one is available. An infinite rate disables limiting entirely.
//!
//! The limiter is intentionally small: fairness between concurrent waiters
//! is best-effort (waiters re-contend after sleeping), which is sufficient
//! for a handful of readers sharing one polling ceiling.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// An async token-bucket rate limiter.
///
/// Cheap to share behind an `Arc`; the rate can be changed at any time with
/// [`RateLimiter::set_rate`] and takes effect from the next refill.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Tokens added per second. May be infinite, which disables limiting.
    rate: f64,

    /// Maximum number of tokens the bucket can hold.
    burst: f64,

    /// Tokens currently available. May be fractional mid-refill.
    tokens: f64,

    /// When the bucket was last refilled.
    refilled: Instant,
}

impl RateLimiter {
    /// Creates a limiter that allows `rate` acquisitions per second with the
    /// given burst capacity.
    ///
    /// The bucket starts full, so the first `burst` acquisitions proceed
    /// immediately.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket {
                rate,
                burst: f64::from(burst),
                tokens: f64::from(burst),
                refilled: Instant::now(),
            }),
        }
    }

    /// Returns the current rate in acquisitions per second.
    pub fn rate(&self) -> f64 {
        self.bucket.lock().expect("limiter mutex poisoned").rate
    }

    /// Sets the rate in acquisitions per second.
    ///
    /// Tokens accrued so far are preserved; only the refill speed changes.
    pub fn set_rate(&self, rate: f64) {
        let mut bucket = self.bucket.lock().expect("limiter mutex poisoned");
        bucket.refill();
        bucket.rate = rate;
    }

    /// Waits until a token is available and consumes it.
    ///
    /// Cancel-safe: dropping the future before it resolves consumes nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("limiter mutex poisoned");
                bucket.refill();

                if bucket.rate.is_infinite() || bucket.tokens >= 1.0 {
                    if !bucket.rate.is_infinite() {
                        bucket.tokens -= 1.0;
                    }
                    return;
                }

                // Time until the deficit is refilled at the current rate.
                Duration::from_secs_f64((1.0 - bucket.tokens) / bucket.rate)
            };

            tokio::time::sleep(wait).await;
        }
    }
}

impl Bucket {
    /// Credits tokens for the time elapsed since the last refill.
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now - self.refilled;
        self.refilled = now;

        if self.rate.is_finite() {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_available_immediately() {
        let limiter = RateLimiter::new(1.0, 3);

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn acquisitions_are_paced_at_the_configured_rate() {
        let limiter = RateLimiter::new(50.0, 1);

        // First token is free (full bucket); the next two must each wait
        // ~20ms for a refill.
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30), "elapsed = {:?}", elapsed);
    }

    #[tokio::test]
    async fn infinite_rate_never_blocks() {
        let limiter = RateLimiter::new(f64::INFINITY, 1);

        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn set_rate_takes_effect_for_subsequent_waits() {
        let limiter = RateLimiter::new(1.0, 1);
        limiter.acquire().await; // drain the bucket

        limiter.set_rate(1000.0);
        assert_eq!(limiter.rate(), 1000.0);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}

//! Sliding-window admission control for storage providers.
//!
//! A [`RateLimiter`] remembers the timestamps of the requests it admitted
//! during the trailing minute. Two bounds are derived from that window:
//!
//! - at most `requests_per_minute` admissions in any trailing 60 seconds
//! - at most `burst_size` admissions in any trailing second
//!
//! Callers that would rather wait than be rejected use
//! [`RateLimiter::wait_for_permission`], which polls every 100ms until a slot
//! frees up or the caller's timeout elapses.

use async_lock::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Length of the sustained window.
const MINUTE: Duration = Duration::from_secs(60);

/// Length of the burst window.
const SECOND: Duration = Duration::from_secs(1);

/// Interval between admission attempts in `wait_for_permission`.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Rate limit bounds for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Nominal sustained rate, reported in status.
    pub requests_per_second: u32,
    /// Maximum admissions in any trailing 60 seconds.
    pub requests_per_minute: u32,
    /// Maximum admissions in any trailing second.
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 10,
            requests_per_minute: 600,
            burst_size: 20,
        }
    }
}

/// Snapshot of the limiter state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStatus {
    pub requests_last_second: usize,
    pub requests_last_minute: usize,
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub burst_size: u32,
    pub total_admitted: u64,
    pub total_rejected: u64,
}

/// Sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<VecDeque<Instant>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            window: Mutex::new(VecDeque::new()),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Try to admit one request right now.
    pub async fn acquire(&self) -> bool {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        prune(&mut window, now);

        if window.len() >= self.config.requests_per_minute as usize {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Rate limit: minute bound of {} reached",
                self.config.requests_per_minute
            );
            return false;
        }

        if count_within(&window, now, SECOND) >= self.config.burst_size as usize {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Rate limit: burst of {} reached", self.config.burst_size);
            return false;
        }

        window.push_back(now);
        self.admitted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Poll [`acquire`](Self::acquire) until admitted or `timeout` elapses.
    pub async fn wait_for_permission(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Snapshot of the current window and counters.
    pub async fn status(&self) -> RateLimiterStatus {
        let now = Instant::now();
        let mut window = self.window.lock().await;
        prune(&mut window, now);

        RateLimiterStatus {
            requests_last_second: count_within(&window, now, SECOND),
            requests_last_minute: window.len(),
            requests_per_second: self.config.requests_per_second,
            requests_per_minute: self.config.requests_per_minute,
            burst_size: self.config.burst_size,
            total_admitted: self.admitted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Drop timestamps that left the trailing minute.
fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) >= MINUTE {
            window.pop_front();
        } else {
            break;
        }
    }
}

/// Count timestamps newer than `span` (window is time-ordered).
fn count_within(window: &VecDeque<Instant>, now: Instant, span: Duration) -> usize {
    window
        .iter()
        .rev()
        .take_while(|t| now.duration_since(**t) < span)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_second: burst,
            requests_per_minute: per_minute,
            burst_size: burst,
        })
    }

    async fn admitted(limiter: &RateLimiter, attempts: usize) -> usize {
        let mut count = 0;
        for _ in 0..attempts {
            if limiter.acquire().await {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_bound_within_one_second() {
        let limiter = limiter(600, 5);
        assert_eq!(admitted(&limiter, 12).await, 5);

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!limiter.acquire().await);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(admitted(&limiter, 12).await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_minute_bound() {
        let limiter = limiter(8, 5);
        assert_eq!(admitted(&limiter, 10).await, 5);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(admitted(&limiter, 10).await, 3);

        // The minute window is full even though the burst window is empty.
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!limiter.acquire().await);

        // The first five admissions age out after 60s.
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(admitted(&limiter, 10).await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_permission_smooths_bursts() {
        let limiter = limiter(600, 2);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);

        let started = Instant::now();
        assert!(limiter.wait_for_permission(Duration::from_secs(5)).await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1));
        assert!(waited < Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_permission_times_out() {
        let limiter = limiter(600, 1);
        assert!(limiter.acquire().await);

        let started = Instant::now();
        assert!(!limiter.wait_for_permission(Duration::from_millis(300)).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_counts() {
        let limiter = limiter(600, 3);
        admitted(&limiter, 5).await;

        let status = limiter.status().await;
        assert_eq!(status.requests_last_second, 3);
        assert_eq!(status.requests_last_minute, 3);
        assert_eq!(status.total_admitted, 3);
        assert_eq!(status.total_rejected, 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        let status = limiter.status().await;
        assert_eq!(status.requests_last_second, 0);
        assert_eq!(status.requests_last_minute, 3);
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// No trailing second ever holds more than `burst_size`
            /// admissions, and no trailing minute more than
            /// `requests_per_minute`.
            #[test]
            fn admissions_respect_bounds(
                burst in 1..10u32,
                extra_per_minute in 0..40u32,
                gaps_ms in proptest::collection::vec(0..400u64, 1..300),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .expect("runtime");

                rt.block_on(async {
                    let per_minute = burst + extra_per_minute;
                    let limiter = limiter(per_minute, burst);
                    let mut admitted_at: Vec<Instant> = Vec::new();

                    for gap in gaps_ms {
                        tokio::time::advance(Duration::from_millis(gap)).await;
                        if limiter.acquire().await {
                            let now = Instant::now();
                            let within = |span: Duration| {
                                admitted_at.iter().filter(|t| now - **t < span).count() + 1
                            };
                            prop_assert!(within(Duration::from_secs(1)) <= burst as usize);
                            prop_assert!(within(Duration::from_secs(60)) <= per_minute as usize);
                            admitted_at.push(now);
                        }
                    }

                    let status = limiter.status().await;
                    prop_assert_eq!(status.total_admitted, admitted_at.len() as u64);
                    Ok(())
                })?;
            }
        }
    }
}

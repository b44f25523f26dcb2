use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Allowed request rate for one upstream source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub requests: u32,
    pub per: Duration,
}

impl RateLimit {
    /// `None` for zero, which means unlimited.
    pub fn per_minute(requests: u32) -> Option<Self> {
        (requests > 0).then_some(Self {
            requests,
            per: Duration::from_secs(60),
        })
    }

    /// Time needed to earn back one request.
    pub fn refill_interval(&self) -> Duration {
        self.per / self.requests.max(1)
    }
}

/// Starts full, so a burst of `requests` goes through immediately; after
/// that one request is released per refill interval.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: u32,
    interval: Duration,
    state: Mutex<Refill>,
}

#[derive(Debug)]
struct Refill {
    available: u32,
    refilled_at: Instant,
}

impl TokenBucket {
    pub(crate) fn new(limit: RateLimit) -> Self {
        Self {
            capacity: limit.requests.max(1),
            interval: limit.refill_interval(),
            state: Mutex::new(Refill {
                available: limit.requests.max(1),
                refilled_at: Instant::now(),
            }),
        }
    }

    pub(crate) async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let since = now.saturating_duration_since(state.refilled_at);
                let earned = u32::try_from(since.as_nanos() / self.interval.as_nanos().max(1))
                    .unwrap_or(u32::MAX);
                if earned > 0 {
                    state.available = state.available.saturating_add(earned).min(self.capacity);
                    state.refilled_at = if state.available == self.capacity {
                        now
                    } else {
                        state.refilled_at + self.interval * earned
                    };
                }
                if state.available > 0 {
                    state.available -= 1;
                    return;
                }
                self.interval
                    .saturating_sub(now.saturating_duration_since(state.refilled_at))
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_per_minute_means_unlimited() {
        assert_eq!(RateLimit::per_minute(0), None);
        let limit = RateLimit::per_minute(30).unwrap();
        assert_eq!(limit.per, Duration::from_secs(60));
        assert_eq!(limit.refill_interval(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn burst_up_to_capacity_does_not_wait() {
        let bucket = TokenBucket::new(RateLimit::per_minute(3).unwrap());
        let started = Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn requests_past_the_burst_wait_for_a_refill() {
        let bucket = TokenBucket::new(RateLimit {
            requests: 2,
            per: Duration::from_millis(100),
        });
        bucket.acquire().await;
        bucket.acquire().await;
        let started = Instant::now();
        bucket.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}

use governor::{DefaultDirectRateLimiter, Quota};
use std::time::Duration;

/// Spaces out worker launches so a batch does not hit shared browser
/// infrastructure all at once. The first launch goes immediately, every
/// following one waits for the next slot.
pub struct RateLimiter {
    limiter: Option<DefaultDirectRateLimiter>,
}

impl RateLimiter {
    /// One launch per `period`; a zero period disables spacing.
    pub fn per_period(period: Duration) -> Self {
        Self {
            limiter: Quota::with_period(period).map(DefaultDirectRateLimiter::direct),
        }
    }

    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn spaces_acquisitions() {
        let limiter = RateLimiter::per_period(Duration::from_millis(50));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn zero_period_never_waits() {
        let limiter = RateLimiter::per_period(Duration::ZERO);
        let start = Instant::now();
        for _ in 0..100 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}

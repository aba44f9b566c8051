//! ---
//! mtr_section: "01-core-functionality"
//! mtr_subsection: "module"
//! mtr_type: "source"
//! mtr_scope: "code"
//! mtr_description: "Device coordination hub and its components."
//! mtr_version: "v0.0.0-prealpha"
//! mtr_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Fixed-period tick source for the status loop.
///
/// A late tick shifts the schedule instead of bursting to catch up, so a
/// stalled loop never floods the sessions with back-to-back snapshots.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
    period: Duration,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick and return how late it fired.
    pub async fn tick(&mut self) -> Duration {
        let scheduled = self.interval.tick().await;
        Instant::now().saturating_duration_since(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_the_period() {
        let mut limiter = RateLimiter::new(Duration::from_millis(50));
        let started = Instant::now();
        for _ in 0..5 {
            limiter.tick().await;
        }
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_delay_instead_of_bursting() {
        let mut limiter = RateLimiter::new(Duration::from_millis(50));
        limiter.tick().await;
        tokio::time::sleep(Duration::from_millis(175)).await;
        let late = limiter.tick().await;
        assert_eq!(late, Duration::from_millis(125));
        let before = Instant::now();
        limiter.tick().await;
        assert_eq!(before.elapsed(), Duration::from_millis(50));
    }
}

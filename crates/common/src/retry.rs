use std::time::Duration;

/// Capped exponential backoff schedule.
///
/// One policy serves both retry sites in the system: the provider client
/// pacing its request retries, and database startup waiting out a schema
/// lock. Attempt numbers are 1-based; the first retry waits `base`, every
/// further attempt doubles the wait, and `cap` bounds the schedule. How
/// many attempts to spend (a count, a wall-clock budget) is the caller's
/// decision, not the policy's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay to sleep after `attempt` consecutive failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // 31 doublings already overflows any sane base; clamp before pow.
        let doublings = attempt.saturating_sub(1).min(31);
        self.base
            .saturating_mul(2_u32.saturating_pow(doublings))
            .min(self.cap)
    }
}

use std::time::Duration;

use rand::Rng;

/// Exponential backoff schedule: `base * factor^attempt`, capped, with a
/// bounded attempt count. Jitter is applied at sleep time.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

/// Mail-source page fetches: base 1s, factor 2, cap 30s, 5 attempts.
pub const MAIL_FETCH: BackoffPolicy = BackoffPolicy {
    base: Duration::from_secs(1),
    factor: 2,
    cap: Duration::from_secs(30),
    max_attempts: 5,
};

/// LLM transport errors: base 2s, factor 2, cap 60s, 3 attempts.
pub const LLM_TRANSPORT: BackoffPolicy = BackoffPolicy {
    base: Duration::from_secs(2),
    factor: 2,
    cap: Duration::from_secs(60),
    max_attempts: 3,
};

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based: the delay after the
    /// first failure is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(attempt.min(20));
        self.base.saturating_mul(multiplier).min(self.cap)
    }

    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let mut rng = rand::thread_rng();
        let jitter: f64 = rng.gen_range(0.75..=1.25);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }

    pub fn attempts_exhausted(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }
}

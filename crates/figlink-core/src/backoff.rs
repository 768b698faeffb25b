use std::time::Duration;

/// Reconnection schedule: attempt `n` (0-based) waits `initial * 2^n`,
/// clamped to `max_delay` when set, and no attempt is made once `n`
/// reaches `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_attempts: u32,
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max_attempts: 10,
            max_delay: Some(Duration::from_secs(30)),
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max_attempts,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self.initial.checked_mul(factor).unwrap_or(Duration::MAX);
        Some(match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        })
    }

    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..).map_while(move |attempt| self.delay_for(attempt))
    }
}

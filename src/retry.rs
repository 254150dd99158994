use crate::cms::CmsApiError;
use rand::Rng;
use std::time::Duration;

/// One retry policy for the whole scheduler, replacing per-call-site ad hoc
/// loops. The classifier maps each error class to a decision; delays are
/// exponential with jitter except for rate limiting, which uses a fixed
/// cooldown.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_jitter: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        /// Defense-system blocks additionally rotate the outgoing identity
        /// string before the next attempt.
        rotate_identity: bool,
    },
    Exhausted,
    Terminal,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: env_u64("CMS_MAX_RETRIES")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_attempts),
            base_delay: env_u64("CMS_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_jitter: env_u64("CMS_RETRY_JITTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_jitter),
            rate_limit_cooldown: env_u64("CMS_RATE_LIMIT_COOLDOWN_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.rate_limit_cooldown),
        }
    }

    /// Exponential backoff for the given zero-based attempt index:
    /// `base * 2^attempt + jitter`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        scaled + sample_jitter(self.max_jitter)
    }

    /// Decides what to do after attempt `attempt` (zero-based) failed with
    /// `error`.
    pub fn classify(&self, error: &CmsApiError, attempt: u32) -> RetryDecision {
        let retriable = matches!(
            error,
            CmsApiError::Blocked
                | CmsApiError::RateLimited
                | CmsApiError::Server(_)
                | CmsApiError::Network(_)
                | CmsApiError::Timeout
        );
        if !retriable {
            return RetryDecision::Terminal;
        }
        if attempt + 1 >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        match error {
            CmsApiError::Blocked => RetryDecision::Retry {
                delay: self.backoff(attempt),
                rotate_identity: true,
            },
            CmsApiError::RateLimited => RetryDecision::Retry {
                delay: self.rate_limit_cooldown,
                rotate_identity: false,
            },
            _ => RetryDecision::Retry {
                delay: self.backoff(attempt),
                rotate_identity: false,
            },
        }
    }
}

/// A randomized pause: `base` plus up to `jitter` extra. Fixed delays make
/// the traffic pattern look mechanical, which is what the remote defenses
/// key on.
#[derive(Debug, Clone, Copy)]
pub struct DelayRange {
    pub base: Duration,
    pub jitter: Duration,
}

impl DelayRange {
    pub const fn new(base: Duration, jitter: Duration) -> Self {
        Self { base, jitter }
    }

    pub const fn zero() -> Self {
        Self {
            base: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        self.base + sample_jitter(self.jitter)
    }
}

fn sample_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let ms = rand::rng().random_range(0..=max.as_millis() as u64);
    Duration::from_millis(ms)
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

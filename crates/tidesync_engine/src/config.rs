//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for one zone's sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Record types this zone synchronizes, in pull order.
    pub record_types: Vec<String>,
    /// Maximum number of concurrent pushes to distinct targets.
    pub push_fan_out: usize,
    /// Maximum number of changes requested per pull page.
    pub pull_page_size: u32,
    /// Individual timeout applied by the remote client to each operation.
    pub op_timeout: Duration,
    /// Fallback polling interval when no push transport drives sync.
    pub poll_interval: Option<Duration>,
    /// Retry behavior for transient failures.
    pub retry: RetryConfig,
    /// Minimum backoff after the remote reports quota exhaustion.
    pub quota_backoff_floor: Duration,
}

impl SyncConfig {
    /// Creates a configuration for the given record types.
    pub fn new<I, S>(record_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            record_types: record_types.into_iter().map(Into::into).collect(),
            push_fan_out: 4,
            pull_page_size: 100,
            op_timeout: Duration::from_secs(30),
            poll_interval: None,
            retry: RetryConfig::default(),
            quota_backoff_floor: Duration::from_secs(60),
        }
    }

    /// Sets the push fan-out limit (minimum 1).
    #[must_use]
    pub fn with_push_fan_out(mut self, fan_out: usize) -> Self {
        self.push_fan_out = fan_out.max(1);
        self
    }

    /// Sets the pull page size.
    #[must_use]
    pub fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size;
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Sets the fallback polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the quota backoff floor.
    #[must_use]
    pub fn with_quota_backoff_floor(mut self, floor: Duration) -> Self {
        self.quota_backoff_floor = floor;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up until the next trigger.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given attempt cap.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never retries automatically.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the capped, jittered delay for a given attempt (0-based;
    /// attempt 0 has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter keeps reconnecting devices from thundering.
            let jitter = capped * 0.25 * time_jitter();
            Duration::from_secs_f64(capped + jitter)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Clock-derived jitter in `[0, 1)`; avoids pulling an RNG into the engine.
fn time_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

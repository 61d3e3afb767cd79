//! Retry logic for chat providers
//!
//! Exponential backoff with jitter for transient completion failures.
//! Provider errors carrying an HTTP status are retried only when the status
//! is in the retryable set; transport and decoding failures count as
//! transient; everything else fails fast.

use std::time::Duration;

use crate::error::KilnError;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: usize,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub add_jitter: bool,
    /// Retryable HTTP status codes
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
            retryable_status_codes: vec![
                429, // Too Many Requests
                500, // Internal Server Error
                502, // Bad Gateway
                503, // Service Unavailable
                504, // Gateway Timeout
            ],
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Builder: set max attempts
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Builder: set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Builder: enable/disable jitter
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);

        let clamped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.add_jitter {
            // Up to 25% jitter
            clamped_delay + clamped_delay * 0.25 * rand_jitter()
        } else {
            clamped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Check if a status code is retryable
    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// Whether a completion error is worth retrying under this config.
    ///
    /// Status-bearing provider errors consult the retryable set; plain chat
    /// errors (transport failures, undecodable responses) are transient;
    /// anything else fails fast.
    pub fn should_retry(&self, error: &KilnError) -> bool {
        match error {
            KilnError::ChatHttp { status, .. } => self.is_retryable_status(*status),
            KilnError::Chat(_) => true,
            _ => false,
        }
    }
}

/// Cheap pseudo-random jitter in [0.0, 1.0).
/// A splitmix64 finalizer over a counter and the clock; no rng dependency.
fn rand_jitter() -> f64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let tick = COUNTER.fetch_add(0x9e37_79b9_7f4a_7c15, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);

    let mut z = tick ^ (nanos << 17);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^= z >> 31;

    (z >> 11) as f64 / (1u64 << 53) as f64
}

/// Execute a completion operation with retries.
///
/// Non-retryable errors (see [`RetryConfig::should_retry`]) are returned
/// immediately, without burning the remaining attempts.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, KilnError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, KilnError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= config.max_attempts || !config.should_retry(&e) {
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt - 1);
                tracing::debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying chat completion"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> KilnError {
        KilnError::Chat("connection reset".to_string())
    }

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert!(config.is_retryable_status(429));
        assert!(!config.is_retryable_status(401));
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::default().with_jitter(false);

        assert_eq!(config.delay_for_attempt(0).as_millis(), 500);
        assert_eq!(config.delay_for_attempt(1).as_millis(), 1000);
        assert_eq!(config.delay_for_attempt(2).as_millis(), 2000);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::default();
        for attempt in 0..8 {
            let delay = config.delay_for_attempt(attempt).as_millis();
            let base = 500 * (1 << attempt).min(60);
            assert!(delay as f64 >= base as f64);
            assert!(delay as f64 <= base as f64 * 1.25 + 1.0);
        }
    }

    #[test]
    fn test_should_retry_classification() {
        let config = RetryConfig::default();

        assert!(config.should_retry(&transient()));
        assert!(config.should_retry(&KilnError::ChatHttp {
            status: 503,
            message: "overloaded".to_string(),
        }));
        assert!(!config.should_retry(&KilnError::ChatHttp {
            status: 401,
            message: "bad key".to_string(),
        }));
        assert!(!config.should_retry(&KilnError::Config("nope".to_string())));
    }

    #[tokio::test]
    async fn test_with_retry_eventual_success() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(5));

        let result = with_retry(&config, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(transient())
                } else {
                    Ok("success")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        let config = RetryConfig::default()
            .with_max_attempts(2)
            .with_initial_delay(Duration::from_millis(5));

        let result: Result<(), KilnError> = with_retry(&config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_fails_fast_on_non_retryable_status() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        let config = RetryConfig::default()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(5));

        let result: Result<(), KilnError> = with_retry(&config, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(KilnError::ChatHttp {
                    status: 401,
                    message: "invalid api key".to_string(),
                })
            }
        })
        .await;

        // One attempt, no backoff sleeps.
        assert!(matches!(
            result.unwrap_err(),
            KilnError::ChatHttp { status: 401, .. }
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_honors_retryable_status() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = AtomicUsize::new(0);
        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(5));

        let result = with_retry(&config, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(KilnError::ChatHttp {
                        status: 503,
                        message: "overloaded".to_string(),
                    })
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}

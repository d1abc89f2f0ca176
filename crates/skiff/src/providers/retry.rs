use rand::Rng;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::ProviderError;

/// Callback invoked once per retry with the retry number (starting at 1) and the
/// error that triggered it. The first attempt never fires it.
pub type RetryObserver = Arc<dyn Fn(u32, &(dyn Error + 'static)) + Send + Sync>;

/// Classifies whether a failed call is worth another attempt
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProviderError {
    fn is_retryable(&self) -> bool {
        ProviderError::is_retryable(self)
    }
}

#[derive(Clone)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub on_retry: Option<RetryObserver>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            on_retry: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("exponential_base", &self.exponential_base)
            .field("jitter", &self.jitter)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &(dyn Error + 'static)) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Backoff before the given retry (1-based), capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base = self.initial_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);
        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

/// Run `operation` under the retry policy in `config`.
///
/// Non-retryable errors return immediately without consuming the retry budget. Once the
/// attempts are exhausted the last error is returned as-is.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Error + 'static,
{
    if !config.enabled {
        return operation().await;
    }

    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => {
                tracing::debug!(attempt, error = %err, "error is not retryable");
                return Err(err);
            }
            Err(err) if attempt >= max_attempts => {
                tracing::error!(attempts = attempt, error = %err, "giving up after retries");
                return Err(err);
            }
            Err(err) => {
                let delay = config.delay_for(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "request failed, retrying"
                );
                if let Some(observer) = &config.on_retry {
                    observer(attempt, &err as &(dyn Error + 'static));
                }
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

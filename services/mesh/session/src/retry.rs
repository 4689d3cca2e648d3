//! Retry policy for transient failures.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time
    Fixed,
    /// `base * 2^(retry-1)`, capped at `max_delay`
    Exponential,
}

/// How often and how patiently to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for exponential delays
    pub max_delay: Duration,
    /// Delay growth
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential policy
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.base_delay.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Run `op`, retrying while `is_transient` says the error may clear
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        mut op: F,
        is_transient: impl Fn(&E) -> bool,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.max_retries && is_transient(&e) => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    debug!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        what, e, retry, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if retry > 0 {
                        warn!("{} failed after {} retries: {}", what, retry, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule() {
        let fixed = RetryPolicy::default();
        assert_eq!(fixed.delay_for(1), Duration::from_millis(1500));
        assert_eq!(fixed.delay_for(2), Duration::from_millis(1500));

        let exp = RetryPolicy::exponential(5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(exp.delay_for(1), Duration::from_secs(1));
        assert_eq!(exp.delay_for(2), Duration::from_secs(2));
        assert_eq!(exp.delay_for(3), Duration::from_secs(4));
        assert_eq!(exp.delay_for(4), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<u32, String> = RetryPolicy::default()
            .run(
                "probe",
                || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err("busy".to_string())
                    } else {
                        Ok(n)
                    }
                },
                |e: &String| e == "busy",
            )
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .run(
                "probe",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("gone".to_string())
                },
                |e: &String| e == "busy",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = RetryPolicy::default()
            .run(
                "probe",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("busy".to_string())
                },
                |_: &String| true,
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wavelet_errors::Error;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

fn backoff_for(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = cfg.base_delay.saturating_mul(1u32 << attempt.min(20));
    let capped = exp.min(cfg.max_delay);
    if cfg.jitter {
        capped.mul_f64(rand::random::<f64>())
    } else {
        capped
    }
}

/// Retries `f` up to `cfg.attempts` times. Stops early when `should_retry`
/// returns false for the latest error, when attempts are exhausted, or when
/// `cancel` fires while sleeping between attempts.
pub async fn retry<F, Fut, T>(
    cfg: RetryConfig,
    cancel: &CancellationToken,
    should_retry: impl Fn(&Error) -> bool,
    mut f: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let is_last = attempt + 1 >= cfg.attempts;
                if is_last || !should_retry(&err) {
                    return Err(err);
                }

                let delay = backoff_for(&cfg, attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(err),
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig {
            attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: false,
        };
        let cancel = CancellationToken::new();

        let result = retry(cfg, &cancel, |_| true, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(Error::transient("not yet"))
            } else {
                Ok::<_, Error>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig::default();
        let cancel = CancellationToken::new();

        let result: Result<(), Error> = retry(cfg, &cancel, |e| e.retryable(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::validation("bad input"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let cfg = RetryConfig {
            attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            jitter: false,
        };
        let cancel = CancellationToken::new();

        let result: Result<(), Error> = retry(cfg, &cancel, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::transient("down"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

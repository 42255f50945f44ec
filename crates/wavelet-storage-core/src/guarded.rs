use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wavelet_breaker::{retry, CircuitBreaker, RetryConfig};
use wavelet_errors::{Error, Result};
use wavelet_observability::Metrics;

/// Labels attached to every guarded call's metrics and log lines.
#[derive(Debug, Clone, Copy)]
pub struct CallLabels<'a> {
    pub op: &'static str,
    pub adapter: &'static str,
    pub namespace: &'a str,
}

/// The breaker-check, timing, timeout, retry, and metrics/log wrapper every
/// adapter call and the storage facade's delegate calls go through. This is
/// the one place that pipeline lives, so every call site gets the same
/// observability and failure handling for free.
pub async fn guarded<F, Fut, T>(
    labels: CallLabels<'_>,
    metrics: &Metrics,
    breaker: Option<&CircuitBreaker>,
    retry_cfg: Option<RetryConfig>,
    timeout_ms: Option<u64>,
    cancel: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    if let Some(breaker) = breaker {
        if !breaker.should_allow() {
            tracing::warn!(op = labels.op, adapter = labels.adapter, namespace = labels.namespace, "breaker open, rejecting call");
            return Err(Error::transient(format!("{} circuit open", labels.adapter)));
        }
    }

    let started = Instant::now();

    let call = || async {
        match timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(Duration::from_millis(ms), f()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::timeout(format!("{} timed out after {ms}ms", labels.op))),
                }
            }
            None => f().await,
        }
    };

    let result = match retry_cfg {
        Some(cfg) => retry(cfg, cancel, |e| matches!(e.code, wavelet_errors::ErrorCode::Timeout), call).await,
        None => call().await,
    };

    let elapsed = started.elapsed().as_secs_f64();
    metrics.record_latency("storage_call_latency_seconds", labels.op, elapsed);

    match &result {
        Ok(_) => {
            metrics.counter("storage_calls_total", labels.op);
            tracing::info!(op = labels.op, adapter = labels.adapter, namespace = labels.namespace, elapsed_ms = elapsed * 1000.0, "storage call succeeded");
            if let Some(breaker) = breaker {
                breaker.record_success();
            }
        }
        Err(err) => {
            metrics.counter("storage_errors_total", labels.op);
            tracing::error!(op = labels.op, adapter = labels.adapter, namespace = labels.namespace, code = %err.code, error = %err.message, "storage call failed");
            if let Some(breaker) = breaker {
                breaker.record_failure();
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wavelet_breaker::BreakerConfig;

    #[tokio::test]
    async fn open_breaker_short_circuits_without_calling_delegate() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        });
        breaker.record_failure();
        let metrics = Metrics::new("test");
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<()> = guarded(
            CallLabels { op: "get", adapter: "record", namespace: "ns" },
            &metrics,
            Some(&breaker),
            None,
            None,
            &cancel,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_races_the_delegate() {
        let metrics = Metrics::new("test");
        let cancel = CancellationToken::new();

        let result: Result<()> = guarded(
            CallLabels { op: "get", adapter: "record", namespace: "ns" },
            &metrics,
            None,
            None,
            Some(5),
            &cancel,
            || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            },
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.code, wavelet_errors::ErrorCode::Timeout);
    }
}

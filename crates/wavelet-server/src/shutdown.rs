//! Four-phase graceful shutdown: stop accepting new work, drain the
//! consumer, flush the dispatcher, then close the connection pools. Each
//! phase is a distinct `CancellationToken` so a caller can cancel exactly
//! the right layer instead of tearing everything down at once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Shared readiness flag the `/readyz` handler reads. Flips to `false` the
/// instant shutdown begins, before anything else stops — load balancers
/// need the head start to stop routing new requests here.
#[derive(Clone, Default)]
pub struct Shutdown {
    ready: Arc<AtomicBool>,
    accept: CancellationToken,
    consumers: CancellationToken,
    dispatcher: CancellationToken,
    grace: Duration,
}

impl Shutdown {
    pub fn new(grace: Duration) -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
            accept: CancellationToken::new(),
            consumers: CancellationToken::new(),
            dispatcher: CancellationToken::new(),
            grace,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn accept_token(&self) -> CancellationToken {
        self.accept.clone()
    }

    /// Runs the four phases in order, waiting `grace` between the
    /// accept-stop and consumer-drain phases so in-flight requests that
    /// already passed the readiness check can finish.
    pub async fn run(&self) {
        tracing::info!("shutdown: phase 1/4 — marking not ready");
        self.ready.store(false, Ordering::Release);

        tracing::info!("shutdown: phase 2/4 — stop accepting new connections");
        self.accept.cancel();
        tokio::time::sleep(self.grace).await;

        tracing::info!("shutdown: phase 3/4 — draining consumers");
        self.consumers.cancel();

        tracing::info!("shutdown: phase 4/4 — flushing dispatcher and closing pools");
        self.dispatcher.cancel();
    }

    pub fn consumers_token(&self) -> CancellationToken {
        self.consumers.clone()
    }

    pub fn dispatcher_token(&self) -> CancellationToken {
        self.dispatcher.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_flips_readiness_before_cancelling_anything() {
        let shutdown = Shutdown::new(Duration::from_millis(1));
        assert!(shutdown.is_ready());
        let accept = shutdown.accept_token();
        let consumers = shutdown.consumers_token();

        let handle = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { shutdown.run().await }
        });

        // Readiness must flip immediately, well before the phases finish.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!shutdown.is_ready());

        handle.await.unwrap();
        assert!(accept.is_cancelled());
        assert!(consumers.is_cancelled());
    }
}

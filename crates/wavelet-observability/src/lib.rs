//! Process-wide logging and metrics installation.
//!
//! Exactly one `tracing` subscriber and one `metrics` recorder are installed
//! per process, in `wavelet-server`'s `main`. Everything else is handed a
//! cheap, cloneable [`Metrics`] at construction time rather than reaching
//! for a global — see DESIGN.md for why ("no process-wide singleton").

use std::sync::Arc;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Installs the process-wide `tracing` subscriber. `json` selects structured
/// JSON output (production); otherwise a human-readable formatter is used
/// (local development).
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Installs the process-wide Prometheus recorder and returns a handle whose
/// `render()` method backs the `/metrics` endpoint.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install the prometheus recorder (called more than once?)")
}

/// A namespace/adapter-labelled handle components use to emit metrics.
/// Labels are fixed at construction so call sites never repeat them.
#[derive(Clone, Debug)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    component: &'static str,
}

impl Metrics {
    pub fn new(component: &'static str) -> Self {
        Self {
            inner: Arc::new(MetricsInner { component }),
        }
    }

    pub fn counter(&self, name: &'static str, op: &str) -> u64 {
        metrics::counter!(name, "component" => self.inner.component, "op" => op.to_string())
            .increment(1);
        1
    }

    pub fn record_latency(&self, name: &'static str, op: &str, seconds: f64) {
        metrics::histogram!(name, "component" => self.inner.component, "op" => op.to_string())
            .record(seconds);
    }

    pub fn set_gauge(&self, name: &'static str, label: &str, value: f64) {
        metrics::gauge!(name, "component" => self.inner.component, "label" => label.to_string())
            .set(value);
    }
}

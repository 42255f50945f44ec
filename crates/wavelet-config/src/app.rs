use std::time::Duration;

use clap::Parser;

/// Top-level process configuration, parsed from CLI flags with environment
/// fallbacks. Mirrors the `agent`/`control` binaries' `Args` convention:
/// every flag that makes sense in a container also has an `env` name.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    /// Postgres DSN backing the record adapter and outbox table.
    #[arg(long = "database-url", env = "DATABASE_URL")]
    pub database_url: url::Url,

    /// Redis URL backing the cache provider and broker stream adapter.
    #[arg(long = "redis-url", env = "REDIS_URL")]
    pub redis_url: url::Url,

    /// Path to the versioned storage configuration document (JSON).
    #[arg(long = "storage-config", env = "STORAGE_CONFIG_PATH")]
    pub storage_config_path: std::path::PathBuf,

    /// Address the HTTP/WebSocket server binds to.
    #[arg(long = "bind-addr", env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: std::net::SocketAddr,

    /// Emit JSON logs instead of human-readable ones; set in production.
    #[arg(long = "json-logs", env = "JSON_LOGS")]
    pub json_logs: bool,

    /// Grace period the shutdown coordinator waits for in-flight work to
    /// drain before it cancels the remaining adapters.
    #[arg(
        long = "shutdown-grace",
        env = "SHUTDOWN_GRACE",
        default_value = "10s",
        value_parser = parse_duration
    )]
    pub shutdown_grace: Duration,

    /// Default per-tenant send rate, tokens per second.
    #[arg(long = "rate-limit-per-sec", env = "RATE_LIMIT_PER_SEC", default_value_t = 20)]
    pub rate_limit_per_sec: u32,

    /// Consumer group name the broker stream adapter joins.
    #[arg(long = "consumer-group", env = "CONSUMER_GROUP", default_value = "wavelet-hub")]
    pub consumer_group: String,
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

impl AppConfig {
    /// Convenience wrapper over `clap::Parser::parse`, matching the
    /// teacher's `Args::parse()` call site in `main`.
    pub fn from_env() -> Self {
        Self::parse()
    }
}

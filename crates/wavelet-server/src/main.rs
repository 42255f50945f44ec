use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use wavelet_authz::AuthzMiddleware;
use wavelet_breaker::BreakerConfig;
use wavelet_cache::{CacheManager, CacheManagerConfig, RedisCacheProvider};
use wavelet_config::{AppConfig, StorageConfig};
use wavelet_consumer::{Consumer, ConsumerConfig, Runner as ConsumerRunner};
use wavelet_dispatcher::{Dispatcher, DispatcherConfig, Runner as DispatcherRunner};
use wavelet_observability::{init_metrics, init_tracing, Metrics};
use wavelet_outbox::{DlqWriter, OutboxRepository};
use wavelet_participant_cache::{ParticipantCache, RedisVersionStore};
use wavelet_record_adapter::PostgresRecordAdapter;
use wavelet_server::{
    build_router, AppState, CircuitBreakerRegistry, FacadeParticipantSource, LoggingHub, MessageService, Shutdown,
};
use wavelet_storage_facade::{AdapterRegistry, FacadeConfig, StorageFacade};
use wavelet_stream_adapter::RedisStreamAdapter;

const MESSAGES_NAMESPACE: &str = "messages";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    init_tracing(config.json_logs);
    let metrics_handle = init_metrics();

    tracing::info!(bind_addr = %config.bind_addr, "starting wavelet-server");

    let storage_config_raw = tokio::fs::read_to_string(&config.storage_config_path).await?;
    let storage_config = StorageConfig::from_json(&storage_config_raw)?;

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(config.database_url.as_str())
        .await?;

    let redis_url = config.redis_url.as_str();

    let record_adapter = Arc::new(PostgresRecordAdapter::new(pool.clone(), "wavelet", "records")?);
    record_adapter.bootstrap().await?;

    let stream_adapter = Arc::new(RedisStreamAdapter::connect(redis_url, "wavelet", "wavelet").await?);

    let outbox = Arc::new(OutboxRepository::new(pool.clone()));
    outbox.bootstrap().await?;

    let dlq = Arc::new(DlqWriter::new(pool.clone()));
    dlq.bootstrap().await?;

    let cache_provider = Arc::new(RedisCacheProvider::connect(redis_url, "wavelet").await?);
    let cache_manager = Arc::new(CacheManager::new(
        cache_provider,
        CacheManagerConfig {
            ttl_seconds: storage_config.cache.ttl_seconds.unwrap_or(60),
            staleness_budget_ms: storage_config.consistency.staleness_budget_ms as i64,
        },
        Metrics::new("cache"),
    ));
    cache_manager.init().await?;

    let breakers = Arc::new(CircuitBreakerRegistry::new());

    let mut registry = AdapterRegistry::new();
    registry.bind_record(MESSAGES_NAMESPACE, record_adapter.clone());
    registry.bind_record("conversation_participants", record_adapter.clone());
    registry.bind_stream(MESSAGES_NAMESPACE, stream_adapter.clone());

    let facade = Arc::new(
        StorageFacade::new(registry, Some(cache_manager), Metrics::new("storage_facade"), FacadeConfig::default())
            .with_breaker(breakers.get_or_create("storage_facade", BreakerConfig::default())),
    );

    let version_store = Arc::new(RedisVersionStore::connect(redis_url).await?);
    version_store.spawn_subscriber();
    let participant_cache = ParticipantCache::new(version_store, Metrics::new("participant_cache"));
    let participant_source = Arc::new(FacadeParticipantSource::new(facade.clone()));

    let authz = AuthzMiddleware::new(
        participant_cache,
        participant_source,
        Metrics::new("authz"),
    )
    .with_rate_limit(config.rate_limit_per_sec, std::time::Duration::from_secs(1));

    let message_service = MessageService::new(record_adapter.clone(), outbox.clone(), MESSAGES_NAMESPACE);

    let shutdown = Shutdown::new(config.shutdown_grace);

    let dispatcher = Arc::new(
        Dispatcher::new(
            outbox.clone(),
            stream_adapter.clone(),
            Metrics::new("dispatcher"),
            DispatcherConfig {
                stream_namespace: MESSAGES_NAMESPACE.to_string(),
                ..DispatcherConfig::default()
            },
        )
        .with_breaker(breakers.get_or_create("dispatcher", BreakerConfig::default())),
    );
    let dispatcher_runner = DispatcherRunner::start(dispatcher, shutdown.dispatcher_token());

    let hub = Arc::new(LoggingHub);
    let consumer = Arc::new(Consumer::new(
        stream_adapter.clone(),
        hub,
        dlq,
        Metrics::new("consumer"),
        ConsumerConfig {
            stream_namespace: MESSAGES_NAMESPACE.to_string(),
            group: config.consumer_group.clone(),
            ..ConsumerConfig::default()
        },
    ));
    let consumer_runner = ConsumerRunner::start(consumer, shutdown.consumers_token()).await?;

    let state = Arc::new(AppState {
        message_service,
        authz,
        shutdown: shutdown.clone(),
        breakers,
        metrics_handle,
    });

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;

    tracing::info!("wavelet-server ready");

    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;

    shutdown.run().await;
    consumer_runner.stop().await;
    dispatcher_runner.stop().await;
    pool.close().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

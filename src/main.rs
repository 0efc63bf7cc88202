use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tunnelhub::api::state::AppState;
use tunnelhub::api::create_router;
use tunnelhub::cache::Cache;
use tunnelhub::capacity::CapacityAdmission;
use tunnelhub::config::AppConfig;
use tunnelhub::event_bus::EventBus;
use tunnelhub::fsm::InstanceFsm;
use tunnelhub::heartbeat::HeartbeatEngine;
use tunnelhub::metrics::Metrics;
use tunnelhub::relay_registry::RelayRegistry;
use tunnelhub::shutdown::{install_signal_handlers, GracefulShutdown, ShutdownConfig};
use tunnelhub::store::PostgresStore;
use tunnelhub::sweeper::{Sweeper, SweeperConfig};
use tunnelhub::token_broker::TokenBroker;
use tunnelhub::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config);

    info!(environment = %config.environment, "tunnelhub: starting control plane");

    let postgres = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    postgres.migrate().await?;
    let store: Arc<dyn tunnelhub::store::Store> = Arc::new(postgres.clone());

    let cache = Arc::new(Cache::connect(config.cache.enabled.then(|| config.cache.redis_url.as_deref()).flatten()).await);
    let event_bus = Arc::new(EventBus::new());
    let token_broker = Arc::new(TokenBroker::new(store.clone(), &config));
    let relay_registry = Arc::new(RelayRegistry::new(store.clone()));
    relay_registry.refresh().await?;
    let metrics = Arc::new(Metrics::new());
    let capacity = Arc::new(CapacityAdmission::new(config.capacity.clone()));

    let fsm = Arc::new(InstanceFsm::new(
        store.clone(),
        cache.clone(),
        event_bus.clone(),
        token_broker.clone(),
        relay_registry.clone(),
        metrics.clone(),
        &config,
    ));
    let heartbeat = Arc::new(HeartbeatEngine::new(store.clone(), cache.clone(), fsm.clone(), &config));

    let sweeper = Arc::new(Sweeper::new(
        store.clone(),
        fsm.clone(),
        token_broker.clone(),
        relay_registry.clone(),
        event_bus.clone(),
        metrics.clone(),
        SweeperConfig::from_app_config(&config),
    ));
    sweeper.start();

    let event_bus_handle = event_bus.clone();
    let config = Arc::new(config);
    let state = AppState::new(
        store,
        cache,
        fsm,
        heartbeat,
        token_broker,
        relay_registry,
        capacity,
        event_bus,
        metrics,
        config.clone(),
    );

    let app = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "tunnelhub: listening");

    let shutdown = Arc::new(GracefulShutdown::new(ShutdownConfig::default()));
    install_signal_handlers(shutdown.clone()).await;

    // The server's own graceful-shutdown future only resolves once `begin_drain`
    // is notified, which the `drain_requests` phase below does *after* the
    // sweeper has stopped and the Event Bus has been closed — so the §5 order
    // (stop sweepers -> close Event Bus -> drain requests -> close Store) holds
    // even though the request drain and the phase sequence run as two separate
    // tasks here.
    let begin_drain = Arc::new(tokio::sync::Notify::new());
    let begin_drain_for_server = begin_drain.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { begin_drain_for_server.notified().await })
            .await
    });

    let mut shutdown_signals = shutdown.subscribe();
    shutdown_signals.recv().await.ok();
    info!("tunnelhub: shutdown signal received, running phased shutdown sequence");

    let sweeper_for_shutdown = sweeper.clone();
    let postgres_for_shutdown = postgres;

    shutdown
        .execute(
            move || Box::pin(async move { sweeper_for_shutdown.stop() }),
            move || Box::pin(async move { event_bus_handle.close() }),
            move || {
                Box::pin(async move {
                    begin_drain.notify_one();
                    match server_task.await {
                        Ok(Ok(())) => true,
                        Ok(Err(err)) => {
                            error!(error = %err, "tunnelhub: server exited with an error");
                            false
                        }
                        Err(err) => {
                            error!(error = %err, "tunnelhub: server task panicked");
                            false
                        }
                    }
                })
            },
            move || Box::pin(async move { postgres_for_shutdown.pool().close().await; Ok(()) }),
        )
        .await
        .unwrap_or_else(|err| warn!(error = %err, "tunnelhub: shutdown sequence reported an error"));

    info!("tunnelhub: shutdown complete");
    Ok(())
}

/// Layered tracing init (§9 ambient stack): `RUST_LOG` wins if set, otherwise
/// `config.logging.level`; `config.logging.json` switches the console layer
/// between human-readable and structured output.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("info,tunnelhub={}", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).init();
    }
}

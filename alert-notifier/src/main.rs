//! Poll the security alert notification queue and push new alerts to WebSocket subscribers.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use alert_common::{
    health::HealthRegistry, metrics::setup_metrics_routes, store::PgNotificationStore,
};
use alert_notifier::config::Config;
use alert_notifier::error::NotifierError;
use alert_notifier::{create_router, AppState, Dispatcher, QueuePoller, StreamRegistry};

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for SIGINT: {}", error);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!("failed to listen for SIGTERM: {}", error);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), NotifierError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let store = PgNotificationStore::new(&config.database_url, config.max_pg_connections)?;

    let liveness = HealthRegistry::new("liveness");
    let poller_liveness = liveness.register(
        "poller".to_string(),
        time::Duration::try_from(config.liveness_deadline.0).unwrap_or(time::Duration::seconds(30)),
    );

    let registry = StreamRegistry::new();
    let shutdown = CancellationToken::new();

    let poller = QueuePoller::new(
        Arc::new(store.clone()),
        Dispatcher::new(registry.clone()),
        config.poll_interval.0,
        config.connection_backoff.0,
        poller_liveness,
    );
    let poller_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { poller.run(shutdown).await }
    });

    let app = create_router(AppState {
        registry,
        alerts: Arc::new(store),
        liveness,
        subscriber_buffer_size: config.subscriber_buffer_size.0,
        shutdown: shutdown.clone(),
    });
    let app = setup_metrics_routes(app)
        .map_err(|error| NotifierError::MetricsError(error.to_string()))?;

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .map_err(|error| NotifierError::BindError {
            bind: bind.clone(),
            error,
        })?;
    tracing::info!("listening on {}", bind);

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    shutdown.cancel();
    if let Err(error) = poller_task.await {
        tracing::error!("poller task failed: {}", error);
    }

    served.map_err(NotifierError::ServeError)
}

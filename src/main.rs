use std::future::ready;
use std::net::SocketAddr;
use std::path::PathBuf;

use axum::routing::get;
use sessiond::{app, config, database, initialize_state, telemetry};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "cannot listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => tracing::error!(%err, "cannot listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining connections");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,sessiond=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config::Configuration::default();
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        config = config.path(PathBuf::from(path));
    }
    let config = config.read();

    let state = match initialize_state(config.clone()).await {
        Ok(state) => state,
        Err(err) => {
            tracing::error!(%err, "cannot initialize application state");
            std::process::exit(1);
        },
    };

    database::spawn_purge(state.db.tokens.clone(), database::PURGE_INTERVAL);

    let mut router = app(state);
    match telemetry::setup_metrics_recorder() {
        Ok(handle) => {
            // `GET /metrics` goes to Prometheus exporter.
            router = router.route("/metrics", get(move || ready(handle.render())));
        },
        Err(err) => tracing::warn!(%err, "metrics recorder not installed, `/metrics` disabled"),
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, %addr, "cannot bind listener");
            std::process::exit(1);
        },
    };
    tracing::info!(%addr, version = config.version(), "server listening");

    if let Err(err) = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        tracing::error!(%err, "server stopped");
        std::process::exit(1);
    }
}

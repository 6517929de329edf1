//! Subscribe to the TIC labels published by the meter and store them in PostgreSQL.
use std::future::ready;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use tic_tsdb::config::Config;
use tic_tsdb::error::PipelineError;
use tic_tsdb::health::PipelineHealth;
use tic_tsdb::metrics::{serve, setup_metrics_routes};
use tic_tsdb::pipeline::Pipeline;

async fn index() -> &'static str {
    "tic-tsdb"
}

fn setup_tracing() {
    let log_layer = fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    setup_tracing();
    info!("Starting up...");

    let config = Config::init_from_env().expect("Invalid configuration:");
    let health = PipelineHealth::new();

    let bind = config.bind();
    let liveness = health.clone();
    let readiness = health.clone();
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(move || ready(readiness.readiness())))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = setup_metrics_routes(router);
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::task::spawn(async move {
        wait_for_shutdown_signal().await;
        token.cancel();
    });

    let pipeline = Pipeline::new(config, health, shutdown);
    match pipeline.run().await {
        Ok(stats) => {
            info!(
                written = stats.written,
                failed = stats.failed,
                "Shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!("Pipeline stopped: {}", e);
            Err(e)
        }
    }
}

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const MESSAGES_RECEIVED: &str = "tic_mqtt_messages_received";
pub const MESSAGES_FILTERED: &str = "tic_mqtt_messages_filtered";
pub const DECODE_ERRORS: &str = "tic_decode_errors";
pub const MQTT_CONNECTION_ERRORS: &str = "tic_mqtt_connection_errors";
pub const ACK_BACKLOG: &str = "tic_mqtt_ack_backlog";

pub const EVENTS_ENQUEUED: &str = "tic_dispatch_events_enqueued";
pub const EVENTS_DROPPED: &str = "tic_dispatch_events_dropped";
pub const QUEUE_FULL: &str = "tic_dispatch_queue_full";
pub const QUEUE_IN_FLIGHT: &str = "tic_dispatch_queue_in_flight";

pub const UPSERTS_ISSUED: &str = "tic_upserts_issued";
pub const UPSERT_FAILED: &str = "tic_upsert_failed";
pub const VALUE_PARSE_ERRORS: &str = "tic_value_parse_errors";
pub const UPSERT_TIME: &str = "tic_upsert_time_seconds";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint to a router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router.route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Single-row upserts, so the interesting range is well under a second.
    const BUCKETS: &[f64] = &[
        0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .expect("histogram buckets are not empty")
        .install_recorder()
        .expect("failed to install the prometheus recorder")
}

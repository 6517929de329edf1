use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::app_context::AppContext;
use crate::config::Config;
use crate::dispatch::{dispatch_queue, DispatchReceiver};
use crate::error::{PipelineError, WriteError};
use crate::health::{HealthHandle, PipelineHealth, PipelineState};
use crate::metrics::{UPSERT_FAILED, UPSERT_TIME, VALUE_PARSE_ERRORS};
use crate::mqtt::MqttSession;
use crate::router::classify;
use crate::types::TelemetryEvent;

const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Counters returned by `consume` once the queue is closed and drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub written: u64,
    pub failed: u64,
}

/// Classify one event and write it. Errors are returned to the caller, never retried.
pub async fn write_event(pool: &PgPool, event: &TelemetryEvent) -> Result<(), WriteError> {
    let upsert = classify(event).inspect_err(|_| {
        metrics::counter!(VALUE_PARSE_ERRORS, &[("field", event.field.as_str())]).increment(1);
    })?;

    let start = Instant::now();
    let result = upsert.issue(pool).await;
    metrics::histogram!(UPSERT_TIME, &[("table", upsert.table())])
        .record(start.elapsed().as_secs_f64());

    if result.is_err() {
        metrics::counter!(UPSERT_FAILED, &[("table", upsert.table())]).increment(1);
    }
    result
}

/// The single writer: dequeue events one at a time and await each write before
/// taking the next, so writes never overlap and happen in queue order. A failed
/// event is logged and dropped. Returns once every sender is gone and the queue
/// is empty.
pub async fn consume(
    pool: &PgPool,
    mut queue: DispatchReceiver<TelemetryEvent>,
    liveness: &HealthHandle,
    report_interval: Duration,
) -> ConsumerStats {
    let mut stats = ConsumerStats::default();

    loop {
        liveness.report_healthy();

        // Wake up now and then while idle, to keep reporting healthy.
        let event = tokio::select! {
            event = queue.recv() => event,
            _ = tokio::time::sleep(report_interval) => continue,
        };
        let Some(event) = event else {
            break;
        };

        match write_event(pool, &event).await {
            Ok(_) => stats.written += 1,
            Err(e) => {
                error!("{}", e);
                stats.failed += 1;
            }
        }
    }

    stats
}

/// One run of the ingestion pipeline, from connecting to the database to the
/// end of the drain that follows `shutdown`.
pub struct Pipeline {
    config: Config,
    health: PipelineHealth,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(config: Config, health: PipelineHealth, shutdown: CancellationToken) -> Self {
        Self {
            config,
            health,
            shutdown,
        }
    }

    /// Run until shutdown is requested. Any error before the pipeline is running
    /// is returned and leaves the pipeline terminated.
    pub async fn run(&self) -> Result<ConsumerStats, PipelineError> {
        let result = self.run_inner().await;
        match &result {
            Ok(_) => {
                self.health.advance(PipelineState::Terminated);
            }
            Err(e) => self.health.fail(e),
        }
        result
    }

    async fn start(&self) -> Result<(AppContext, MqttSession), PipelineError> {
        self.health.advance(PipelineState::ConnectingDatabase);
        let context = AppContext::connect(&self.config.sql).await?;

        self.health.advance(PipelineState::ApplyingMigrations);
        context.migrate().await?;

        self.health.advance(PipelineState::ConnectingBroker);
        let mut session = MqttSession::connect(&self.config.mqtt).await?;

        self.health.advance(PipelineState::Subscribing);
        session.subscribe().await?;

        Ok((context, session))
    }

    async fn run_inner(&self) -> Result<ConsumerStats, PipelineError> {
        let (context, session) = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                info!("Shutdown requested before the pipeline started");
                return Ok(ConsumerStats::default());
            }
            started = self.start() => started?,
        };

        let (sender, receiver) = dispatch_queue(
            self.config.dispatch_queue_capacity,
            self.config.backpressure(),
        );

        let deadline = self.config.liveness_deadline.0;
        // An idle broker connection only shows signs of life on keep-alive pings.
        let mqtt_deadline = deadline.max(self.config.mqtt.mqtt_keep_alive.0 * 2);
        let mqtt_liveness = self.health.register("mqtt", to_health_duration(mqtt_deadline));
        let writer_liveness = self.health.register("writer", to_health_duration(deadline));

        let delivery = tokio::spawn(session.deliver(
            sender,
            self.shutdown.clone(),
            mqtt_liveness,
        ));

        self.health.advance(PipelineState::Running);

        let report_interval = (deadline / 4).max(MIN_REPORT_INTERVAL);
        let consumer = consume(&context.pool, receiver, &writer_liveness, report_interval);
        tokio::pin!(consumer);

        let stats = tokio::select! {
            stats = &mut consumer => stats,
            _ = self.shutdown.cancelled() => {
                self.health.advance(PipelineState::Draining);
                info!("Shutdown requested, draining queued events...");
                consumer.as_mut().await
            }
        };

        delivery.await?;
        context.close().await;
        info!(
            written = stats.written,
            failed = stats.failed,
            "Pipeline drained"
        );

        Ok(stats)
    }
}

fn to_health_duration(duration: Duration) -> time::Duration {
    time::Duration::try_from(duration).unwrap_or(time::Duration::MINUTE)
}

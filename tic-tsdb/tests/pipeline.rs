use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use tic_tsdb::decoder::decode;
use tic_tsdb::dispatch::{dispatch_queue, BackpressurePolicy};
use tic_tsdb::error::WriteError;
use tic_tsdb::health::PipelineHealth;
use tic_tsdb::pipeline::{consume, write_event, ConsumerStats};
use tic_tsdb::upsert::{CurrentSample, EnergyReading, PowerSample};

const TS: i64 = 1650000000;

fn ts() -> DateTime<Utc> {
    DateTime::from_timestamp(TS, 0).unwrap()
}

fn topic(label: &str) -> String {
    format!("esp-tic/status/tic/{label}")
}

fn payload(ts: i64, val: &str) -> String {
    format!(r#"{{"ts":{ts},"val":"{val}"}}"#)
}

/// Push publishes through decode, the dispatch queue and the writer, the way
/// the MQTT delivery task does.
async fn ingest(pool: &PgPool, publishes: &[(String, String, bool)]) -> ConsumerStats {
    let (sender, receiver) = dispatch_queue(publishes.len(), BackpressurePolicy::Block);

    for (topic, body, retained) in publishes {
        if let Ok(Some(event)) = decode(topic, body.as_bytes(), *retained) {
            sender.send(event).await.unwrap();
        }
    }
    drop(sender);

    let health = PipelineHealth::new();
    let liveness = health.register("writer", time::Duration::seconds(30));
    consume(pool, receiver, &liveness, Duration::from_secs(1)).await
}

async fn current_rows(pool: &PgPool) -> Vec<(DateTime<Utc>, i16, i32)> {
    sqlx::query_as("SELECT \"timestamp\", phase, current FROM current ORDER BY phase")
        .fetch_all(pool)
        .await
        .unwrap()
}

async fn power_rows(pool: &PgPool) -> Vec<(DateTime<Utc>, i32)> {
    sqlx::query_as("SELECT \"timestamp\", power FROM power ORDER BY \"timestamp\"")
        .fetch_all(pool)
        .await
        .unwrap()
}

async fn energy_rows(pool: &PgPool) -> Vec<(DateTime<Utc>, String, i32)> {
    sqlx::query_as("SELECT \"timestamp\", tariff, reading FROM energy ORDER BY tariff")
        .fetch_all(pool)
        .await
        .unwrap()
}

async fn row_count(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        "SELECT (SELECT count(*) FROM current) + (SELECT count(*) FROM power) + (SELECT count(*) FROM energy)",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test(migrations = "./migrations")]
async fn current_is_written_with_its_phase(db: PgPool) {
    let stats = ingest(&db, &[(topic("IINST2"), payload(TS, "5"), false)]).await;

    assert_eq!(stats, ConsumerStats { written: 1, failed: 0 });
    assert_eq!(current_rows(&db).await, vec![(ts(), 2, 5)]);
}

#[sqlx::test(migrations = "./migrations")]
async fn power_is_written(db: PgPool) {
    ingest(&db, &[(topic("PAPP"), payload(TS, "350"), false)]).await;

    assert_eq!(power_rows(&db).await, vec![(ts(), 350)]);
    assert_eq!(row_count(&db).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn energy_is_written_with_its_tariff(db: PgPool) {
    ingest(&db, &[(topic("HCHP"), payload(TS, "12345"), false)]).await;

    assert_eq!(energy_rows(&db).await, vec![(ts(), "HCHP".to_owned(), 12345)]);
    assert_eq!(row_count(&db).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_and_retained_publishes_write_nothing(db: PgPool) {
    let stats = ingest(
        &db,
        &[
            (topic("UNKNOWN"), payload(TS, "1"), false),
            (topic("ADCO"), "not even json".to_owned(), false),
            (topic("IINST"), payload(TS, "3"), true),
        ],
    )
    .await;

    assert_eq!(stats, ConsumerStats::default());
    assert_eq!(row_count(&db).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn redelivery_overwrites_instead_of_duplicating(db: PgPool) {
    ingest(
        &db,
        &[
            (topic("IINST2"), payload(TS, "5"), false),
            (topic("IINST2"), payload(TS, "7"), false),
        ],
    )
    .await;

    assert_eq!(current_rows(&db).await, vec![(ts(), 2, 7)]);

    // Same value again is a no-op.
    ingest(&db, &[(topic("IINST2"), payload(TS, "7"), false)]).await;
    assert_eq!(current_rows(&db).await, vec![(ts(), 2, 7)]);
}

#[sqlx::test(migrations = "./migrations")]
async fn bad_events_do_not_stop_the_writer(db: PgPool) {
    let stats = ingest(
        &db,
        &[
            (topic("PAPP"), payload(TS, "n/a"), false),
            (topic("PAPP"), "{\"ts\":".to_owned(), false),
            (topic("PAPP"), payload(TS + 1, "420"), false),
            (topic("BASE"), payload(TS + 1, "000123456"), false),
        ],
    )
    .await;

    assert_eq!(stats, ConsumerStats { written: 2, failed: 1 });
    assert_eq!(
        power_rows(&db).await,
        vec![(DateTime::from_timestamp(TS + 1, 0).unwrap(), 420)]
    );
    assert_eq!(
        energy_rows(&db).await,
        vec![(
            DateTime::from_timestamp(TS + 1, 0).unwrap(),
            "BASE".to_owned(),
            123456
        )]
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn events_keep_their_order(db: PgPool) {
    let publishes: Vec<_> = (1..=5)
        .map(|i| (topic("IINST"), payload(TS, &i.to_string()), false))
        .collect();
    let stats = ingest(&db, &publishes).await;

    assert_eq!(stats.written, 5);
    assert_eq!(current_rows(&db).await, vec![(ts(), 0, 5)]);
}

#[sqlx::test(migrations = "./migrations")]
async fn three_phase_currents_are_separate_rows(db: PgPool) {
    ingest(
        &db,
        &[
            (topic("IINST1"), payload(TS, "4"), false),
            (topic("IINST2"), payload(TS, "5"), false),
            (topic("IINST3"), payload(TS, "6"), false),
        ],
    )
    .await;

    assert_eq!(
        current_rows(&db).await,
        vec![(ts(), 1, 4), (ts(), 2, 5), (ts(), 3, 6)]
    );
}

#[sqlx::test(migrations = "./migrations")]
async fn write_event_reports_invalid_values(db: PgPool) {
    let event = decode(&topic("HCHC"), payload(TS, "12.5").as_bytes(), false)
        .unwrap()
        .unwrap();

    assert!(matches!(
        write_event(&db, &event).await,
        Err(WriteError::ParseValue { field: "HCHC", .. })
    ));
    assert_eq!(row_count(&db).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn upserts_can_be_issued_directly(db: PgPool) {
    CurrentSample {
        timestamp: ts(),
        phase: 0,
        current: 12,
    }
    .issue(&db)
    .await
    .unwrap();
    PowerSample {
        timestamp: ts(),
        power: 2300,
    }
    .issue(&db)
    .await
    .unwrap();
    EnergyReading {
        timestamp: ts(),
        tariff: "HCHC",
        reading: 98765,
    }
    .issue(&db)
    .await
    .unwrap();

    assert_eq!(current_rows(&db).await, vec![(ts(), 0, 12)]);
    assert_eq!(power_rows(&db).await, vec![(ts(), 2300)]);
    assert_eq!(energy_rows(&db).await, vec![(ts(), "HCHC".to_owned(), 98765)]);
}

#[sqlx::test(migrations = "./migrations")]
async fn phase_outside_of_the_meter_range_is_rejected(db: PgPool) {
    let result = CurrentSample {
        timestamp: ts(),
        phase: 4,
        current: 1,
    }
    .issue(&db)
    .await;

    assert!(matches!(
        result,
        Err(WriteError::Query {
            table: "current",
            ..
        })
    ));
}

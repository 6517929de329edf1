use std::num::ParseIntError;

use thiserror::Error;

/// A publish whose body could not be decoded. The message is dropped.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid payload on {topic}: {error}")]
    Payload {
        topic: String,
        error: serde_json::Error,
    },
}

/// Enumeration of errors raised while writing a single event. None of them are retried.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("{field} value {value:?} is not a base-10 integer: {error}")]
    ParseValue {
        field: &'static str,
        value: String,
        error: ParseIntError,
    },
    #[error("upsert into {table} failed with: {error}")]
    Query {
        table: &'static str,
        error: sqlx::Error,
    },
}

/// Enumeration of errors related to the MQTT session.
#[derive(Error, Debug)]
pub enum MqttError {
    #[error("invalid MQTT broker url {0}")]
    InvalidBrokerUrl(String),
    #[error("mqtt: timeout waiting for connection")]
    ConnectTimeout,
    #[error("mqtt: timeout waiting for subscribe")]
    SubscribeTimeout,
    #[error("mqtt: broker rejected subscription to {0}")]
    SubscribeRejected(String),
    #[error("mqtt request could not be queued: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("mqtt connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}

/// Errors that stop the pipeline before (or instead of) reaching the running state.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid database configuration: {0}")]
    DatabaseConfig(sqlx::Error),
    #[error("failed to connect to PostgreSQL: {0}")]
    DatabaseConnection(sqlx::Error),
    #[error("failed to apply schema migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Mqtt(#[from] MqttError),
    #[error("pipeline task panicked or was aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

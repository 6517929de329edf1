use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::dispatch::{BackpressureMode, BackpressurePolicy};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub sql: SqlConfig,

    #[envconfig(nested = true)]
    pub mqtt: MqttConfig,

    /// How many decoded events may wait for the database writer.
    #[envconfig(default = "10")]
    pub dispatch_queue_capacity: usize,

    #[envconfig(default = "block")]
    pub backpressure_policy: BackpressureMode,

    #[envconfig(default = "5000")]
    pub backpressure_timeout_ms: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub liveness_deadline: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn backpressure(&self) -> BackpressurePolicy {
        match self.backpressure_policy {
            BackpressureMode::Block => BackpressurePolicy::Block,
            BackpressureMode::BlockWithTimeout => {
                BackpressurePolicy::BlockWithTimeout(self.backpressure_timeout_ms.0)
            }
            BackpressureMode::DropOldest => BackpressurePolicy::DropOldest,
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct SqlConfig {
    pub sql_hostname: NonEmptyString,

    #[envconfig(default = "5432")]
    pub sql_port: u16,

    #[envconfig(default = "")]
    pub sql_username: String,

    #[envconfig(default = "")]
    pub sql_password: String,

    pub sql_database: NonEmptyString,

    #[envconfig(default = "disable")]
    pub sql_sslmode: String,

    #[envconfig(default = "1")]
    pub max_pg_connections: u32,
}

impl SqlConfig {
    /// Connection options for the PostgreSQL server, built field by field so that
    /// credentials never need escaping into a URL.
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        let mut options = PgConnectOptions::new()
            .host(self.sql_hostname.as_str())
            .port(self.sql_port)
            .database(self.sql_database.as_str())
            .ssl_mode(PgSslMode::from_str(&self.sql_sslmode)?);

        if !self.sql_username.is_empty() {
            options = options.username(&self.sql_username);
        }
        if !self.sql_password.is_empty() {
            options = options.password(&self.sql_password);
        }

        Ok(options)
    }
}

#[derive(Envconfig, Clone)]
pub struct MqttConfig {
    /// tcp://hostname:port or ssl://hostname:port
    pub mqtt_broker: NonEmptyString,

    pub mqtt_username: Option<String>,

    pub mqtt_password: Option<String>,

    #[envconfig(default = "tic-tsdb")]
    pub mqtt_client_id: NonEmptyString,

    #[envconfig(default = "esp-tic")]
    pub mqtt_topic_prefix: NonEmptyString,

    /// Bound on connect and subscribe operations.
    #[envconfig(default = "30000")]
    pub mqtt_timeout: EnvMsDuration,

    /// Bound on the disconnect operation at shutdown.
    #[envconfig(default = "5000")]
    pub mqtt_grace_period: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub mqtt_keep_alive: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub mqtt_reconnect_delay: EnvMsDuration,

    // Unsubscribing drops the persistent session's subscription on the broker,
    // so nothing is queued for us while we are down.
    #[envconfig(default = "false")]
    pub mqtt_unsubscribe_on_shutdown: bool,
}

impl MqttConfig {
    /// The single wildcard subscription covering every TIC field of the device.
    pub fn topic_filter(&self) -> String {
        format!("{}/status/tic/#", self.mqtt_topic_prefix.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

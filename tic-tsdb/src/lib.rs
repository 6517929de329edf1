pub mod app_context;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod metrics;
pub mod mqtt;
pub mod pipeline;
pub mod router;
pub mod time;
pub mod types;
pub mod upsert;

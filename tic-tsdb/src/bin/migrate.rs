//! Apply or inspect the schema migrations without starting the pipeline.
//!
//! Usage: `tic-tsdb-migrate [up|status]`, with the same `SQL_*` variables as the service.
use envconfig::Envconfig;
use eyre::{bail, Result};
use tracing::info;

use tic_tsdb::app_context::{AppContext, MIGRATOR};
use tic_tsdb::config::SqlConfig;

async fn status(context: &AppContext) -> Result<()> {
    let has_table: bool =
        sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations') IS NOT NULL")
            .fetch_one(&context.pool)
            .await?;

    let applied: Vec<i64> = if has_table {
        sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success ORDER BY version")
            .fetch_all(&context.pool)
            .await?
    } else {
        Vec::new()
    };

    for migration in MIGRATOR.iter() {
        let state = match applied.contains(&migration.version) {
            true => "applied",
            false => "pending",
        };
        println!("{} {} ({})", migration.version, migration.description, state);
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "up".to_owned());
    let config = SqlConfig::init_from_env()?;
    let context = AppContext::connect(&config).await?;

    match command.as_str() {
        "up" => {
            context.migrate().await?;
            info!("Schema is up-to-date");
        }
        "status" => status(&context).await?,
        other => bail!("unknown command {other:?}, expected one of: up, status"),
    }

    context.close().await;
    Ok(())
}

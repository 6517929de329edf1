use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::SqlConfig;
use crate::error::PipelineError;

/// Schema of the `current`, `power` and `energy` tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Database side of the pipeline. The pool is only ever used by the writer loop
/// (and by migrations, before the writer starts).
pub struct AppContext {
    pub pool: PgPool,
}

impl AppContext {
    /// Connect eagerly, so an unreachable server fails startup rather than the first write.
    pub async fn connect(config: &SqlConfig) -> Result<Self, PipelineError> {
        let options = config
            .connect_options()
            .map_err(PipelineError::DatabaseConfig)?;

        info!(
            host = config.sql_hostname.as_str(),
            database = config.sql_database.as_str(),
            "Connecting to PostgreSQL server..."
        );
        let pool = PgPoolOptions::new()
            .max_connections(config.max_pg_connections.max(1))
            .connect_with(options)
            .await
            .map_err(PipelineError::DatabaseConnection)?;

        Ok(Self { pool })
    }

    /// Bring the schema up to date.
    pub async fn migrate(&self) -> Result<(), PipelineError> {
        info!("Ensuring db schema is up-to-date...");
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

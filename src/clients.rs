use crate::config::Config;
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};

pub const SCHEMA: &str = include_str!("../schema.sql");

/// Creates and returns a new database connection pool.
pub async fn setup_db_pool(config: &Config) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(config.database_url())
        .await
}

/// Creates the gateway tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    pool.execute(SCHEMA).await?;
    Ok(())
}

//! PostgreSQL pool and migration helpers for the durable stores.

use std::path::Path;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::Result;

/// Create a connection pool for the credential, session, role, and key stores.
/// Acquisition is bounded so a saturated pool surfaces as a transient store
/// error instead of stalling a login.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await?;

    info!(
        max_connections = config.max_connections,
        "Connected to PostgreSQL"
    );
    Ok(pool)
}

/// Apply the schema migrations shipped under `./migrations`.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let migrator = sqlx::migrate::Migrator::new(Path::new("./migrations")).await?;
    migrator.run(pool).await?;

    info!(
        migrations = migrator.migrations.len(),
        "Database migrations applied"
    );
    Ok(())
}

//! Postgres schema bootstrap.

use sqlx::PgPool;
use tracing::info;

const WAGER_SCHEMA: &str = include_str!("../migrations/0001_wager.sql");

/// Apply the schema. Every statement is `IF NOT EXISTS`, so this runs on each start.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(WAGER_SCHEMA).execute(pool).await?;
    info!("wager schema applied");
    Ok(())
}

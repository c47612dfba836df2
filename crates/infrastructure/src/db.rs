//! 连接池与迁移

use config::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::repository::PgStorage;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

/// 建立连接池、执行迁移并组装全部仓储
pub async fn connect(config: &DatabaseConfig) -> Result<PgStorage, InfrastructureError> {
    let pool = create_pg_pool(&config.url, config.max_connections).await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!(max_connections = config.max_connections, "database ready");
    Ok(PgStorage::new(pool))
}

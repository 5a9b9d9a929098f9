//! 数据库连接池与迁移管理
//! 提供 PostgreSQL 连接池、迁移执行和会话表的健康检查

use crate::config::DatabaseConfig;
use secrecy::ExposeSecret;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// 会话安全依赖的表（由 migrations 创建）
pub const SESSION_TABLES: [&str; 3] = ["refresh_tokens", "rate_limit_attempts", "audit_events"];

/// 由配置构建连接池参数
pub fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
}

/// 创建数据库连接池
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DbError> {
    let pool = pool_options(config)
        .connect(config.url.expose_secret())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to session store");
            DbError::ConnectionFailed(e.to_string())
        })?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Session store pool ready"
    );
    Ok(pool)
}

/// 运行数据库迁移
pub async fn run_migrations(pool: &PgPool) -> Result<(), DbError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        tracing::error!(error = %e, "Session schema migration failed");
        DbError::MigrationFailed(e.to_string())
    })?;

    tracing::info!(tables = ?SESSION_TABLES, "Session schema up to date");
    Ok(())
}

/// 健康检查：数据库可达且会话表齐全
pub async fn health_check(pool: &PgPool) -> HealthStatus {
    let missing: Result<Vec<String>, sqlx::Error> =
        sqlx::query_scalar("SELECT t FROM unnest($1::text[]) AS t WHERE to_regclass(t) IS NULL")
            .bind(SESSION_TABLES.as_slice())
            .fetch_all(pool)
            .await;

    let status = match missing {
        Ok(missing) => HealthStatus::from_missing_tables(missing),
        Err(e) => HealthStatus::Unhealthy(e.to_string()),
    };

    if !status.is_healthy() {
        tracing::warn!(
            status = ?status,
            pool_size = pool.size(),
            idle = pool.num_idle(),
            "Session store health check failed"
        );
    }
    status
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// 可连接，但缺少会话表（迁移未执行）
    MissingTables(Vec<String>),
    Unhealthy(String),
}

impl HealthStatus {
    fn from_missing_tables(missing: Vec<String>) -> Self {
        if missing.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::MissingTables(missing)
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

//! Rate limit repository (限流数据访问)
//!
//! 每次尝试一行。过期行只在访问该键时顺带删除。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::{RateLimitStore, WindowSnapshot};
use crate::error::Result;
use crate::models::rate_limit::RateLimitKey;

pub struct RateLimitRepository {
    db: PgPool,
}

impl RateLimitRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

const WINDOW_QUERY: &str = r#"
    WITH purged AS (
        DELETE FROM rate_limit_attempts
        WHERE identity = $1 AND action = $2 AND attempted_at < $3
    )
    SELECT attempted_at
    FROM rate_limit_attempts
    WHERE identity = $1 AND action = $2 AND attempted_at >= $3
    ORDER BY attempted_at ASC
"#;

#[async_trait]
impl RateLimitStore for RateLimitRepository {
    async fn append(&self, key: &RateLimitKey, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limit_attempts (identity, action, attempted_at) VALUES ($1, $2, $3)",
        )
        .bind(key.identity())
        .bind(key.action().as_str())
        .bind(at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn window(
        &self,
        key: &RateLimitKey,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let timestamps: Vec<DateTime<Utc>> = sqlx::query_scalar(WINDOW_QUERY)
            .bind(key.identity())
            .bind(key.action().as_str())
            .bind(window_start)
            .fetch_all(&self.db)
            .await?;

        Ok(timestamps)
    }

    async fn append_if_below(
        &self,
        key: &RateLimitKey,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<WindowSnapshot> {
        let mut tx = self.db.begin().await?;

        // 事务级咨询锁：同一键的 清理/计数/追加 串行执行，不同键互不影响
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key.to_string())
            .execute(&mut *tx)
            .await?;

        let timestamps: Vec<DateTime<Utc>> = sqlx::query_scalar(WINDOW_QUERY)
            .bind(key.identity())
            .bind(key.action().as_str())
            .bind(window_start)
            .fetch_all(&mut *tx)
            .await?;

        let admitted = (timestamps.len() as u64) < max_attempts as u64;
        if admitted {
            sqlx::query(
                "INSERT INTO rate_limit_attempts (identity, action, attempted_at) VALUES ($1, $2, $3)",
            )
            .bind(key.identity())
            .bind(key.action().as_str())
            .bind(at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(WindowSnapshot {
            timestamps,
            admitted,
        })
    }

    async fn clear(&self, key: &RateLimitKey) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_attempts WHERE identity = $1 AND action = $2")
            .bind(key.identity())
            .bind(key.action().as_str())
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

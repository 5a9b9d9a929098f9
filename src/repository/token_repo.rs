//! Refresh token repository (令牌数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::TokenStore;
use crate::error::{AppError, Result};
use crate::models::token::{RefreshToken, SubjectId};

pub struct TokenRepository {
    db: PgPool,
}

impl TokenRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

/// 唯一约束冲突映射为 Conflict，其余保持数据库错误
fn map_insert_error(e: sqlx::Error) -> AppError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            AppError::Conflict("duplicate refresh token".to_string())
        }
        _ => AppError::Database(e),
    }
}

const INSERT_TOKEN: &str = r#"
    INSERT INTO refresh_tokens (
        id, token_hash, subject_id, issued_at, expires_at, revoked, revoked_at,
        rotated_from, origin, user_agent
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

fn bind_insert<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    token: &'q RefreshToken,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(token.id)
        .bind(&token.token_hash)
        .bind(token.subject_id)
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.revoked_at)
        .bind(token.rotated_from)
        .bind(&token.origin)
        .bind(&token.user_agent)
}

#[async_trait]
impl TokenStore for TokenRepository {
    async fn insert_token(&self, token: &RefreshToken) -> Result<()> {
        bind_insert(sqlx::query(INSERT_TOKEN), token)
            .execute(&self.db)
            .await
            .map_err(map_insert_error)?;

        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let token =
            sqlx::query_as::<_, RefreshToken>("SELECT * FROM refresh_tokens WHERE token_hash = $1")
                .bind(token_hash)
                .fetch_optional(&self.db)
                .await?;

        Ok(token)
    }

    async fn revoke_if_active(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = $2 WHERE token_hash = $1 AND revoked = FALSE",
        )
        .bind(token_hash)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn rotate(
        &self,
        old_hash: &str,
        now: DateTime<Utc>,
        replacement: &RefreshToken,
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        // 并发轮换时第二个 UPDATE 会等待行锁，提交后重新求值条件并命中 0 行
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = $2
            WHERE token_hash = $1 AND revoked = FALSE AND expires_at > $2
            "#,
        )
        .bind(old_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        bind_insert(sqlx::query(INSERT_TOKEN), replacement)
            .execute(&mut *tx)
            .await
            .map_err(map_insert_error)?;

        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_all_for_subject(
        &self,
        subject_id: SubjectId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = $2 WHERE subject_id = $1 AND revoked = FALSE",
        )
        .bind(subject_id)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM refresh_tokens WHERE expires_at < $1 OR (revoked AND revoked_at < $1)",
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

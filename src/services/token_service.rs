//! 刷新令牌服务：签发、校验、轮换、撤销
//!
//! 存储故障一律向上传播（失败即拒绝）。

use crate::{
    clock::Clock,
    config::TokenConfig,
    error::{AppError, Result},
    models::token::*,
    repository::{with_timeout, TokenStore},
};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// 摘要冲突时的最大重试次数
const MAX_INSERT_ATTEMPTS: u32 = 3;

pub struct TokenService {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl TokenService {
    pub fn new(
        store: Arc<dyn TokenStore>,
        config: TokenConfig,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            timeout,
        }
    }

    /// 签发新令牌
    pub async fn issue(&self, subject_id: SubjectId) -> Result<IssuedToken> {
        self.issue_with_context(subject_id, &ClientContext::default())
            .await
    }

    /// 签发新令牌并记录客户端信息
    pub async fn issue_with_context(
        &self,
        subject_id: SubjectId,
        client: &ClientContext,
    ) -> Result<IssuedToken> {
        let now = self.clock.now();

        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let (secret, record) = self.new_record(subject_id, now, client, None);

            match with_timeout(self.timeout, "token.insert", self.store.insert_token(&record)).await {
                Ok(()) => {
                    metrics::counter!("session_tokens_issued_total").increment(1);
                    tracing::info!(subject_id, token_id = %record.id, "Refresh token issued");
                    return Ok(issued(secret, &record));
                }
                Err(AppError::Conflict(_)) if attempt < MAX_INSERT_ATTEMPTS => {
                    tracing::warn!(subject_id, attempt, "Refresh token hash collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::internal_error("refresh token issuance exhausted retries"))
    }

    /// 校验令牌
    ///
    /// 检查顺序：不存在 → 已撤销 → 已过期。
    pub async fn verify(&self, secret: &str) -> Result<VerifiedToken> {
        let now = self.clock.now();
        self.verify_at(secret, now).await
    }

    /// 轮换令牌：撤销旧令牌并为同一主体签发新令牌
    ///
    /// 并发提交同一令牌时只有一个调用成功，其余得到 [`AppError::TokenRevoked`]。
    pub async fn rotate(&self, secret: &str) -> Result<IssuedToken> {
        let now = self.clock.now();
        let current = self.verify_at(secret, now).await?;
        let old = &current.record;
        let client = ClientContext {
            origin: old.origin.clone(),
            user_agent: old.user_agent.clone(),
        };

        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let (new_secret, replacement) =
                self.new_record(old.subject_id, now, &client, Some(old.id));

            let rotated = with_timeout(
                self.timeout,
                "token.rotate",
                self.store.rotate(&old.token_hash, now, &replacement),
            )
            .await;

            match rotated {
                Ok(true) => {
                    metrics::counter!("session_tokens_rotated_total").increment(1);
                    tracing::info!(
                        subject_id = old.subject_id,
                        old_token_id = %old.id,
                        token_id = %replacement.id,
                        "Refresh token rotated"
                    );
                    return Ok(issued(new_secret, &replacement));
                }
                Ok(false) => {
                    let err = self.explain_lost_rotation(&old.token_hash, now).await?;
                    tracing::warn!(
                        subject_id = old.subject_id,
                        token_id = %old.id,
                        reason = rejection_reason(&err),
                        "Refresh token rotation lost"
                    );
                    reject(&err);
                    return Err(err);
                }
                Err(AppError::Conflict(_)) if attempt < MAX_INSERT_ATTEMPTS => {
                    tracing::warn!(subject_id = old.subject_id, attempt, "Replacement token hash collision, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(AppError::internal_error("refresh token rotation exhausted retries"))
    }

    /// 撤销令牌（幂等：不存在或已撤销时不做任何事）
    pub async fn revoke(&self, secret: &str) -> Result<()> {
        validate_secret(secret)?;
        let now = self.clock.now();
        let token_hash = hash_token(secret);

        let changed = with_timeout(
            self.timeout,
            "token.revoke",
            self.store.revoke_if_active(&token_hash, now),
        )
        .await?;

        if changed {
            tracing::info!("Refresh token revoked");
        } else {
            tracing::debug!("Refresh token revoke was a no-op");
        }
        Ok(())
    }

    /// 撤销主体的全部令牌，返回新撤销的数量
    pub async fn revoke_all(&self, subject_id: SubjectId) -> Result<u64> {
        let now = self.clock.now();
        let revoked = with_timeout(
            self.timeout,
            "token.revoke_all",
            self.store.revoke_all_for_subject(subject_id, now),
        )
        .await?;

        tracing::info!(subject_id, revoked, "All refresh tokens revoked for subject");
        Ok(revoked)
    }

    /// 删除过期或撤销超过宽限期的令牌
    pub async fn purge_stale(&self, grace: chrono::Duration) -> Result<u64> {
        let cutoff = self.clock.now() - grace;
        let purged = with_timeout(self.timeout, "token.delete_stale", self.store.delete_stale(cutoff))
            .await?;

        metrics::counter!("retention_purged_total", "kind" => "refresh_token").increment(purged);
        Ok(purged)
    }

    async fn verify_at(&self, secret: &str, now: DateTime<Utc>) -> Result<VerifiedToken> {
        validate_secret(secret)?;
        let token_hash = hash_token(secret);

        let record = with_timeout(self.timeout, "token.find", self.store.find_by_hash(&token_hash))
            .await?
            .ok_or(AppError::TokenNotFound)
            .inspect_err(reject)?;

        record.ensure_active(now).inspect_err(reject)?;

        Ok(VerifiedToken {
            subject_id: record.subject_id,
            record,
        })
    }

    /// 条件轮换未命中时重新读取记录，判断失败原因
    async fn explain_lost_rotation(&self, token_hash: &str, now: DateTime<Utc>) -> Result<AppError> {
        let record = with_timeout(self.timeout, "token.find", self.store.find_by_hash(token_hash))
            .await?;

        Ok(match record {
            None => AppError::TokenNotFound,
            Some(record) => match record.ensure_active(now) {
                Err(e) => e,
                Ok(()) => AppError::TokenRevoked,
            },
        })
    }

    fn new_record(
        &self,
        subject_id: SubjectId,
        now: DateTime<Utc>,
        client: &ClientContext,
        rotated_from: Option<Uuid>,
    ) -> (String, RefreshToken) {
        let secret = generate_secret(self.config.secret_bytes);
        let ttl = chrono::Duration::seconds(self.config.refresh_token_ttl_secs as i64);

        let record = RefreshToken {
            id: Uuid::new_v4(),
            token_hash: hash_token(&secret),
            subject_id,
            issued_at: now,
            expires_at: now + ttl,
            revoked: false,
            revoked_at: None,
            rotated_from,
            origin: client.origin.clone(),
            user_agent: client.user_agent.clone(),
        };
        (secret, record)
    }
}

/// 生成令牌明文（OS 随机数，十六进制编码）
fn generate_secret(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

fn issued(secret: String, record: &RefreshToken) -> IssuedToken {
    IssuedToken {
        secret,
        token_id: record.id,
        subject_id: record.subject_id,
        expires_at: record.expires_at,
    }
}

fn rejection_reason(err: &AppError) -> &'static str {
    match err {
        AppError::TokenNotFound => "not_found",
        AppError::TokenExpired => "expired",
        AppError::TokenRevoked => "revoked",
        _ => "other",
    }
}

fn reject(err: &AppError) {
    if err.is_token_rejection() {
        metrics::counter!("session_token_rejections_total", "reason" => rejection_reason(err))
            .increment(1);
    }
}

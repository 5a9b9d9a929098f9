//! Refresh token domain models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// 令牌所属主体（用户）标识
pub type SubjectId = i64;

/// 令牌明文最短长度（32 字节随机数的十六进制编码）
pub const SECRET_HEX_LEN: usize = 64;

/// 令牌明文最长长度（128 字节）
pub const MAX_SECRET_HEX_LEN: usize = 256;

/// Refresh token record
///
/// 明文令牌从不落库，只保存其 SHA-256 摘要。
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub token_hash: String,
    pub subject_id: SubjectId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    /// 轮换来源（可选的谱系信息，不参与正确性判断）
    pub rotated_from: Option<Uuid>,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
}

/// 令牌状态
///
/// Expired 由时间推导，从不写回存储。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    Active,
    Revoked,
    Expired,
}

impl RefreshToken {
    /// 计算给定时刻的令牌状态（撤销优先于过期）
    pub fn state_at(&self, now: DateTime<Utc>) -> TokenState {
        if self.revoked {
            TokenState::Revoked
        } else if now >= self.expires_at {
            TokenState::Expired
        } else {
            TokenState::Active
        }
    }

    /// 将非活跃状态映射为对应错误
    pub fn ensure_active(&self, now: DateTime<Utc>) -> Result<(), AppError> {
        match self.state_at(now) {
            TokenState::Active => Ok(()),
            TokenState::Revoked => Err(AppError::TokenRevoked),
            TokenState::Expired => Err(AppError::TokenExpired),
        }
    }
}

/// 客户端上下文（来源地址与客户端描述）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContext {
    pub origin: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn new(origin: impl Into<String>, user_agent: Option<&str>) -> Self {
        Self {
            origin: Some(origin.into()),
            user_agent: user_agent.map(|s| s.to_string()),
        }
    }
}

/// 签发结果：明文令牌只在此处出现一次
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub secret: String,
    pub token_id: Uuid,
    pub subject_id: SubjectId,
    pub expires_at: DateTime<Utc>,
}

/// 校验通过的令牌
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub subject_id: SubjectId,
    pub record: RefreshToken,
}

/// 哈希令牌用于存储
pub fn hash_token(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 校验令牌明文格式
pub fn validate_secret(secret: &str) -> Result<(), AppError> {
    if secret.len() < SECRET_HEX_LEN || secret.len() > MAX_SECRET_HEX_LEN || secret.len() % 2 != 0 {
        return Err(AppError::validation("refresh token has invalid length"));
    }
    if !secret.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(AppError::validation("refresh token has invalid characters"));
    }
    Ok(())
}

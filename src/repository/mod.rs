//! Storage repository layer
//!
//! 服务层只依赖这里的 trait，生产环境使用 PostgreSQL 实现，测试使用内存实现，
//! 两者对服务层行为完全一致。

pub mod audit_repo;
pub mod memory;
pub mod rate_limit_repo;
pub mod token_repo;

pub use audit_repo::AuditRepository;
pub use memory::MemoryStore;
pub use rate_limit_repo::RateLimitRepository;
pub use token_repo::TokenRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::models::audit::{AuditEvent, AuditFilters, Page, SecurityAnalytics, Timeframe};
use crate::models::rate_limit::RateLimitKey;
use crate::models::token::{RefreshToken, SubjectId};

/// 刷新令牌存储
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// 插入新令牌；摘要重复时返回 [`AppError::Conflict`]
    async fn insert_token(&self, token: &RefreshToken) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>>;

    /// 条件撤销：仅当 revoked = false 时置位，返回是否发生了状态变化
    async fn revoke_if_active(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool>;

    /// 原子轮换：撤销未撤销且未过期的旧令牌并插入替换令牌。
    /// 旧令牌不满足条件时不做任何修改并返回 false。
    async fn rotate(
        &self,
        old_hash: &str,
        now: DateTime<Utc>,
        replacement: &RefreshToken,
    ) -> Result<bool>;

    /// 撤销主体的全部令牌，返回新撤销的数量
    async fn revoke_all_for_subject(&self, subject_id: SubjectId, now: DateTime<Utc>)
        -> Result<u64>;

    /// 删除在 cutoff 之前已过期或已撤销的令牌
    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 限流窗口快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    /// 追加前窗口内的时间戳（升序）
    pub timestamps: Vec<DateTime<Utc>>,
    /// 本次是否已追加
    pub admitted: bool,
}

/// 限流尝试记录存储
///
/// 过期记录只在访问时惰性清理。
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn append(&self, key: &RateLimitKey, at: DateTime<Utc>) -> Result<()>;

    /// 清理 window_start 之前的记录并返回剩余时间戳（升序）
    async fn window(
        &self,
        key: &RateLimitKey,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// 在同一键的串行区内完成 清理 → 计数 → 未达上限则追加
    async fn append_if_below(
        &self,
        key: &RateLimitKey,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<WindowSnapshot>;

    async fn clear(&self, key: &RateLimitKey) -> Result<u64>;
}

/// 审计事件存储（仅追加）
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_event(&self, event: &AuditEvent) -> Result<()>;

    async fn events_by_subject(
        &self,
        subject_id: SubjectId,
        filters: &AuditFilters,
        page: Page,
    ) -> Result<Vec<AuditEvent>>;

    async fn count_by_subject(&self, subject_id: SubjectId, filters: &AuditFilters)
        -> Result<i64>;

    async fn events_by_origin(
        &self,
        origin: &str,
        timeframe: Timeframe,
        limit: i64,
    ) -> Result<Vec<AuditEvent>>;

    /// 高风险（High/Critical）或被拦截的事件
    async fn suspicious_events(&self, timeframe: Timeframe, limit: i64)
        -> Result<Vec<AuditEvent>>;

    async fn analytics(&self, timeframe: Timeframe) -> Result<SecurityAnalytics>;

    /// 主体此前是否从该来源成功登录过
    async fn origin_seen(&self, subject_id: SubjectId, origin: &str) -> Result<bool>;

    /// 删除 cutoff 之前发生的事件
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// 为存储调用加上超时，超时视为存储不可用
pub async fn with_timeout<T, F>(timeout: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = timeout.as_millis() as u64;
            tracing::warn!(operation, timeout_ms, "Store call timed out");
            metrics::counter!("store_timeouts_total", "operation" => operation).increment(1);
            Err(AppError::StoreUnavailable(format!(
                "{} timed out after {}ms",
                operation, timeout_ms
            )))
        }
    }
}

//! 滑动窗口限流
//!
//! 按 (来源标识, 动作类型) 计数，窗口内保存精确时间戳。
//! 存储故障或超时时放行（fail open）并记录告警。

use crate::{
    clock::Clock,
    config::RateLimitSettings,
    error::{AppError, Result},
    models::rate_limit::*,
    repository::{with_timeout, RateLimitStore},
};
use std::sync::Arc;
use std::time::Duration;

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    settings: RateLimitSettings,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        settings: RateLimitSettings,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            settings,
            clock,
            timeout,
        }
    }

    /// 动作对应的配置策略
    pub fn policy(&self, action: RateLimitAction) -> RateLimitPolicy {
        self.settings.policy_for(action)
    }

    /// 记录一次尝试（失败时仅告警）
    pub async fn record_attempt(&self, key: &RateLimitKey) {
        let now = self.clock.now();
        if let Err(e) = with_timeout(self.timeout, "rate_limit.append", self.store.append(key, now)).await {
            fail_open(key, &e);
        }
    }

    /// 检查键在窗口内是否已达上限（不记录本次尝试）
    pub async fn check_limit(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitStatus> {
        policy.validate()?;
        let now = self.clock.now();

        let window = with_timeout(
            self.timeout,
            "rate_limit.window",
            self.store.window(key, policy.window_start(now)),
        )
        .await;

        let timestamps = match window {
            Ok(timestamps) => timestamps,
            Err(e) => {
                fail_open(key, &e);
                return Ok(RateLimitStatus::fail_open(now));
            }
        };

        let status = RateLimitStatus::from_window(&timestamps, policy, now);
        if status.blocked {
            blocked(key, status.attempts);
        }
        Ok(status)
    }

    /// 以原始参数检查限流
    pub async fn check(
        &self,
        identity: &str,
        action: RateLimitAction,
        window_minutes: u32,
        max_attempts: u32,
    ) -> Result<RateLimitStatus> {
        let key = RateLimitKey::new(identity, action)?;
        let policy = RateLimitPolicy::from_minutes(max_attempts, window_minutes);
        self.check_limit(&key, &policy).await
    }

    /// 使用配置中的动作策略检查
    pub async fn check_action(
        &self,
        identity: &str,
        action: RateLimitAction,
    ) -> Result<RateLimitStatus> {
        let key = RateLimitKey::new(identity, action)?;
        self.check_limit(&key, &self.policy(action)).await
    }

    /// 清空键的全部尝试（认证成功后调用）
    pub async fn reset(&self, key: &RateLimitKey) {
        match with_timeout(self.timeout, "rate_limit.clear", self.store.clear(key)).await {
            Ok(cleared) => tracing::debug!(key = %key, cleared, "Rate limit key reset"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to reset rate limit key"),
        }
    }

    /// 原子地 检查 → 未达上限则记录
    ///
    /// 返回状态中的 attempts 包含本次已被放行的尝试。
    pub async fn try_acquire(
        &self,
        key: &RateLimitKey,
        policy: &RateLimitPolicy,
    ) -> Result<RateLimitStatus> {
        policy.validate()?;
        let now = self.clock.now();

        let snapshot = with_timeout(
            self.timeout,
            "rate_limit.append_if_below",
            self.store
                .append_if_below(key, now, policy.window_start(now), policy.max_attempts),
        )
        .await;

        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                fail_open(key, &e);
                return Ok(RateLimitStatus::fail_open(now));
            }
        };

        let mut status = RateLimitStatus::from_window(&snapshot.timestamps, policy, now);
        if snapshot.admitted {
            status.attempts += 1;
            status.blocked = false;
            if snapshot.timestamps.is_empty() {
                status.reset_at = now + policy.window;
            }
        } else {
            status.blocked = true;
            blocked(key, status.attempts);
        }
        Ok(status)
    }
}

fn blocked(key: &RateLimitKey, attempts: u32) {
    metrics::counter!("rate_limit_blocked_total", "action" => key.action().as_str()).increment(1);
    tracing::warn!(key = %key, attempts, "Rate limit exceeded");
}

fn fail_open(key: &RateLimitKey, err: &AppError) {
    metrics::counter!("rate_limit_fail_open_total").increment(1);
    tracing::warn!(key = %key, error = %err, "Rate limit store unavailable, allowing request");
}

//! Rate limit domain models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// 标识最大长度
pub const MAX_IDENTITY_LEN: usize = 255;

/// 限流动作类型：不同动作拥有独立配额
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAction {
    Login,
    Refresh,
    PasswordReset,
    Register,
    Api,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Login => "login",
            RateLimitAction::Refresh => "refresh",
            RateLimitAction::PasswordReset => "password_reset",
            RateLimitAction::Register => "register",
            RateLimitAction::Api => "api",
        }
    }
}

/// 限流键：(来源标识, 动作类型)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    identity: String,
    action: RateLimitAction,
}

impl RateLimitKey {
    pub fn new(identity: &str, action: RateLimitAction) -> Result<Self, AppError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(AppError::validation("rate limit identity must not be empty"));
        }
        if identity.len() > MAX_IDENTITY_LEN {
            return Err(AppError::validation("rate limit identity is too long"));
        }
        Ok(Self {
            identity: identity.to_lowercase(),
            action,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn action(&self) -> RateLimitAction {
        self.action
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.action.as_str(), self.identity)
    }
}

/// 限流策略：窗口内最多允许的尝试次数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self { max_attempts, window }
    }

    pub fn from_minutes(max_attempts: u32, window_minutes: u32) -> Self {
        Self::new(max_attempts, Duration::minutes(window_minutes as i64))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_attempts == 0 {
            return Err(AppError::validation("max_attempts must be greater than zero"));
        }
        if self.window <= Duration::zero() {
            return Err(AppError::validation("window length must be positive"));
        }
        Ok(())
    }

    /// 窗口起点：早于该时刻的记录不计数
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }
}

/// 限流检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub blocked: bool,
    /// 窗口内已计数的尝试次数
    pub attempts: u32,
    /// 窗口内计数降到上限以下的时刻（未超限时即最早一次尝试离开窗口的时刻）
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    /// 由窗口内的时间戳计算状态（时间戳按升序排列）
    pub fn from_window(
        timestamps: &[DateTime<Utc>],
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let attempts = timestamps.len().min(u32::MAX as usize) as u32;
        let blocked = attempts >= policy.max_attempts;
        // 超限时需等到第 attempts - max_attempts 条（从 0 计）离开窗口才解除拦截
        let pivot = if blocked {
            (attempts - policy.max_attempts) as usize
        } else {
            0
        };
        let reset_at = timestamps
            .get(pivot)
            .map(|at| *at + policy.window)
            .unwrap_or(now);
        Self {
            blocked,
            attempts,
            reset_at,
        }
    }

    /// 存储不可用时的放行结果
    pub fn fail_open(now: DateTime<Utc>) -> Self {
        Self {
            blocked: false,
            attempts: 0,
            reset_at: now,
        }
    }

    pub fn into_error(self) -> AppError {
        AppError::RateLimited {
            attempts: self.attempts,
            reset_at: self.reset_at,
        }
    }
}

//! Audit domain models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;
use crate::models::token::SubjectId;

/// 安全审计动作（封闭枚举）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LoginSuccess,
    LoginFailed,
    LoginAttempt,
    Logout,
    Register,
    PasswordResetRequest,
    PasswordResetSuccess,
    PasswordChange,
    ProfileUpdate,
    AvatarUpload,
    RoleChange,
    AccountLock,
    AccountUnlock,
    DataAccess,
    ApiCall,
    SecurityViolation,
    SessionExpired,
}

impl AuditAction {
    pub const ALL: [AuditAction; 17] = [
        AuditAction::LoginSuccess,
        AuditAction::LoginFailed,
        AuditAction::LoginAttempt,
        AuditAction::Logout,
        AuditAction::Register,
        AuditAction::PasswordResetRequest,
        AuditAction::PasswordResetSuccess,
        AuditAction::PasswordChange,
        AuditAction::ProfileUpdate,
        AuditAction::AvatarUpload,
        AuditAction::RoleChange,
        AuditAction::AccountLock,
        AuditAction::AccountUnlock,
        AuditAction::DataAccess,
        AuditAction::ApiCall,
        AuditAction::SecurityViolation,
        AuditAction::SessionExpired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginSuccess => "login_success",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::LoginAttempt => "login_attempt",
            AuditAction::Logout => "logout",
            AuditAction::Register => "register",
            AuditAction::PasswordResetRequest => "password_reset_request",
            AuditAction::PasswordResetSuccess => "password_reset_success",
            AuditAction::PasswordChange => "password_change",
            AuditAction::ProfileUpdate => "profile_update",
            AuditAction::AvatarUpload => "avatar_upload",
            AuditAction::RoleChange => "role_change",
            AuditAction::AccountLock => "account_lock",
            AuditAction::AccountUnlock => "account_unlock",
            AuditAction::DataAccess => "data_access",
            AuditAction::ApiCall => "api_call",
            AuditAction::SecurityViolation => "security_violation",
            AuditAction::SessionExpired => "session_expired",
        }
    }
}

impl FromStr for AuditAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditAction::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| AppError::Validation(format!("unknown audit action: {}", s)))
    }
}

/// 事件结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Blocked,
    Warning,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed => "failed",
            Outcome::Blocked => "blocked",
            Outcome::Warning => "warning",
        }
    }
}

impl FromStr for Outcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "failed" => Ok(Outcome::Failed),
            "blocked" => Ok(Outcome::Blocked),
            "warning" => Ok(Outcome::Warning),
            other => Err(AppError::Validation(format!("unknown outcome: {}", other))),
        }
    }
}

/// 风险等级（声明顺序即严重程度顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    /// 数值等级，用于存储层的范围比较
    pub fn rank(&self) -> i16 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 1,
            RiskLevel::High => 2,
            RiskLevel::Critical => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Result<Self, AppError> {
        match rank {
            0 => Ok(RiskLevel::Low),
            1 => Ok(RiskLevel::Medium),
            2 => Ok(RiskLevel::High),
            3 => Ok(RiskLevel::Critical),
            other => Err(AppError::Validation(format!("unknown risk rank: {}", other))),
        }
    }
}

/// 记录审计事件时的上下文
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuditContext {
    #[validate(length(max = 64))]
    pub origin: Option<String>,
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    pub outcome: Outcome,
    #[validate(length(max = 128))]
    pub session_id: Option<String>,
    /// 近期失败次数（动态风险因子）
    pub failed_attempts: Option<u32>,
    /// 是否来自新位置（动态风险因子）
    #[serde(default)]
    pub new_location: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl Default for AuditContext {
    fn default() -> Self {
        Self {
            origin: None,
            user_agent: None,
            outcome: Outcome::Success,
            session_id: None,
            failed_attempts: None,
            new_location: false,
            details: serde_json::Value::Null,
        }
    }
}

impl AuditContext {
    pub fn with_outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            ..Self::default()
        }
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn user_agent(mut self, user_agent: Option<&str>) -> Self {
        self.user_agent = user_agent.map(|s| s.to_string());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn failed_attempts(mut self, attempts: u32) -> Self {
        self.failed_attempts = Some(attempts);
        self
    }

    pub fn new_location(mut self, new_location: bool) -> Self {
        self.new_location = new_location;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// 审计事件（写入后不可变）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub subject_id: Option<SubjectId>,
    pub action: AuditAction,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub outcome: Outcome,
    pub risk_level: RiskLevel,
    pub context: serde_json::Value,
    pub session_id: Option<String>,
}

impl AuditEvent {
    /// 可疑事件：高风险或被拦截
    pub fn is_suspicious(&self) -> bool {
        self.risk_level >= RiskLevel::High || self.outcome == Outcome::Blocked
    }
}

/// 按主体查询的过滤条件
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilters {
    pub action: Option<AuditAction>,
    pub outcome: Option<Outcome>,
    pub min_risk: Option<RiskLevel>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AuditFilters {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.action.map_or(true, |a| a == event.action)
            && self.outcome.map_or(true, |o| o == event.outcome)
            && self.min_risk.map_or(true, |r| event.risk_level >= r)
            && self.start_time.map_or(true, |t| event.occurred_at >= t)
            && self.end_time.map_or(true, |t| event.occurred_at <= t)
    }
}

/// 分页参数
#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct Page {
    #[validate(range(min = 1, max = 500))]
    pub limit: i64,
    #[validate(range(min = 0))]
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self { limit: 50, offset: 0 }
    }
}

/// 时间范围 [start, end]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeframe {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Timeframe {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AppError> {
        if start > end {
            return Err(AppError::validation("timeframe start must not be after end"));
        }
        Ok(Self { start, end })
    }

    /// 截止到 now 的最近一段时间
    pub fn last(duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            start: now - duration,
            end: now,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at <= self.end
    }
}

/// 按 动作 × 结果 分组的统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionOutcomeStats {
    pub action: AuditAction,
    pub outcome: Outcome,
    pub count: i64,
    pub distinct_actors: i64,
    pub distinct_origins: i64,
}

/// 安全分析结果
#[derive(Debug, Clone, Serialize)]
pub struct SecurityAnalytics {
    pub timeframe: Timeframe,
    pub total_events: i64,
    pub suspicious_events: i64,
    pub distinct_actors: i64,
    pub distinct_origins: i64,
    pub breakdown: Vec<ActionOutcomeStats>,
}

//! 风险分级
//!
//! 纯函数，不访问存储。最终等级取静态表与上下文因子中的较高者，
//! 上下文因子只能提升等级，不会降低。

use crate::models::audit::{AuditAction, AuditContext, RiskLevel};

/// 失败次数超过该值视为暴力尝试
pub const FAILED_ATTEMPTS_THRESHOLD: u32 = 3;

/// 新来源登录的风险下限
pub const NEW_LOCATION_RISK: RiskLevel = RiskLevel::Medium;

/// 按动作类型给出的基础风险
pub fn baseline_risk(action: AuditAction) -> RiskLevel {
    match action {
        AuditAction::SecurityViolation => RiskLevel::Critical,
        AuditAction::LoginFailed | AuditAction::AccountLock => RiskLevel::High,
        AuditAction::PasswordResetRequest | AuditAction::RoleChange | AuditAction::LoginAttempt => {
            RiskLevel::Medium
        }
        AuditAction::LoginSuccess
        | AuditAction::Logout
        | AuditAction::Register
        | AuditAction::PasswordResetSuccess
        | AuditAction::PasswordChange
        | AuditAction::ProfileUpdate
        | AuditAction::AvatarUpload
        | AuditAction::AccountUnlock
        | AuditAction::DataAccess
        | AuditAction::ApiCall
        | AuditAction::SessionExpired => RiskLevel::Low,
    }
}

/// 上下文因子给出的风险下限
pub fn context_risk(context: &AuditContext) -> RiskLevel {
    if context
        .failed_attempts
        .is_some_and(|n| n > FAILED_ATTEMPTS_THRESHOLD)
    {
        RiskLevel::High
    } else if context.new_location {
        NEW_LOCATION_RISK
    } else {
        RiskLevel::Low
    }
}

pub fn classify(action: AuditAction, context: &AuditContext) -> RiskLevel {
    baseline_risk(action).max(context_risk(context))
}

//! 会话守卫：限流检查 → 令牌操作 → 审计投递
//!
//! 认证相关请求的统一入口。审计投递不会阻塞请求，也不会改变请求结果。

use crate::{
    error::{AppError, Result},
    models::{audit::*, rate_limit::*, token::*},
    services::{AuditDispatcher, RateLimiter, TokenService},
};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use validator::Validate;

/// 请求来源信息
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SessionRequest {
    /// 客户端网络地址，同时作为限流标识
    #[validate(length(min = 1, max = 64))]
    pub origin: String,
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    #[validate(length(max = 128))]
    pub session_id: Option<String>,
}

impl SessionRequest {
    pub fn new(origin: impl Into<String>, user_agent: Option<&str>) -> Self {
        Self {
            origin: origin.into(),
            user_agent: user_agent.map(|s| s.to_string()),
            session_id: None,
        }
    }

    fn audit(&self, outcome: Outcome) -> AuditContext {
        let ctx = AuditContext::with_outcome(outcome)
            .origin(self.origin.clone())
            .user_agent(self.user_agent.as_deref());
        match &self.session_id {
            Some(session_id) => ctx.session(session_id.clone()),
            None => ctx,
        }
    }

    fn client(&self) -> ClientContext {
        ClientContext::new(self.origin.clone(), self.user_agent.as_deref())
    }

    fn key(&self, action: RateLimitAction) -> Result<RateLimitKey> {
        RateLimitKey::new(&self.origin, action)
    }
}

pub struct SessionGuard {
    tokens: Arc<TokenService>,
    limiter: Arc<RateLimiter>,
    audit: AuditDispatcher,
}

impl SessionGuard {
    pub fn new(tokens: Arc<TokenService>, limiter: Arc<RateLimiter>, audit: AuditDispatcher) -> Self {
        Self {
            tokens,
            limiter,
            audit,
        }
    }

    /// 登录
    ///
    /// 每次调用在校验凭据前占用一次尝试配额，签发令牌成功后清零。
    /// `authenticate` 校验凭据并返回主体；返回 [`AppError::Unauthorized`] 时审计为失败登录，
    /// 其他错误原样返回。
    pub async fn login<F, Fut>(
        &self,
        identity: &str,
        request: &SessionRequest,
        authenticate: F,
    ) -> Result<IssuedToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SubjectId>>,
    {
        validate_request(request)?;
        let key = request.key(RateLimitAction::Login)?;
        let policy = self.limiter.policy(RateLimitAction::Login);

        // 先原子占用一次尝试配额，再校验凭据
        let status = self.limiter.try_acquire(&key, &policy).await?;
        if status.blocked {
            self.audit.dispatch(
                None,
                AuditAction::LoginAttempt,
                request
                    .audit(Outcome::Blocked)
                    .failed_attempts(status.attempts)
                    .details(serde_json::json!({ "identity": identity })),
            );
            return Err(status.into_error());
        }

        let subject_id = match authenticate().await {
            Ok(subject_id) => subject_id,
            Err(AppError::Unauthorized) => {
                self.audit.dispatch(
                    None,
                    AuditAction::LoginFailed,
                    request
                        .audit(Outcome::Failed)
                        .failed_attempts(status.attempts)
                        .details(serde_json::json!({ "identity": identity })),
                );
                tracing::info!(origin = %request.origin, attempts = status.attempts, "Login failed");
                return Err(AppError::Unauthorized);
            }
            Err(e) => return Err(e),
        };

        let issued = self
            .tokens
            .issue_with_context(subject_id, &request.client())
            .await?;
        self.limiter.reset(&key).await;

        self.audit
            .dispatch_login(subject_id, request.audit(Outcome::Success));

        Ok(issued)
    }

    /// 使用刷新令牌换取新令牌
    pub async fn refresh(&self, secret: &str, request: &SessionRequest) -> Result<IssuedToken> {
        validate_request(request)?;
        let key = request.key(RateLimitAction::Refresh)?;
        let policy = self.limiter.policy(RateLimitAction::Refresh);

        let status = self.limiter.check_limit(&key, &policy).await?;
        if status.blocked {
            self.audit.dispatch(
                None,
                AuditAction::LoginAttempt,
                request
                    .audit(Outcome::Blocked)
                    .failed_attempts(status.attempts)
                    .details(serde_json::json!({ "flow": "refresh" })),
            );
            return Err(status.into_error());
        }

        match self.tokens.rotate(secret).await {
            Ok(issued) => {
                self.audit.dispatch(
                    Some(issued.subject_id),
                    AuditAction::ApiCall,
                    request
                        .audit(Outcome::Success)
                        .details(serde_json::json!({ "flow": "refresh" })),
                );
                Ok(issued)
            }
            Err(e) if e.is_store_unavailable() => Err(e),
            Err(e) => {
                self.limiter.record_attempt(&key).await;
                let failed_attempts = status.attempts + 1;
                let (action, outcome) = match e {
                    AppError::TokenExpired => (AuditAction::SessionExpired, Outcome::Failed),
                    AppError::TokenRevoked => (AuditAction::SecurityViolation, Outcome::Blocked),
                    _ => (AuditAction::LoginAttempt, Outcome::Failed),
                };
                if action == AuditAction::SecurityViolation {
                    tracing::warn!(origin = %request.origin, "Revoked refresh token presented");
                }
                self.audit.dispatch(
                    None,
                    action,
                    request
                        .audit(outcome)
                        .failed_attempts(failed_attempts)
                        .details(serde_json::json!({ "flow": "refresh" })),
                );
                Err(e)
            }
        }
    }

    /// 登出当前会话（幂等）
    pub async fn logout(&self, secret: &str, request: &SessionRequest) -> Result<()> {
        validate_request(request)?;
        let subject_id = self.tokens.verify(secret).await.ok().map(|v| v.subject_id);
        self.tokens.revoke(secret).await?;

        self.audit
            .dispatch(subject_id, AuditAction::Logout, request.audit(Outcome::Success));
        Ok(())
    }

    /// 登出主体的全部会话，返回撤销的令牌数
    pub async fn logout_all(&self, subject_id: SubjectId, request: &SessionRequest) -> Result<u64> {
        validate_request(request)?;
        let revoked = self.tokens.revoke_all(subject_id).await?;

        self.audit.dispatch(
            Some(subject_id),
            AuditAction::Logout,
            request
                .audit(Outcome::Success)
                .details(serde_json::json!({ "scope": "all", "revoked": revoked })),
        );
        Ok(revoked)
    }

    /// 申请重置密码（只负责限流与审计）
    pub async fn request_password_reset(&self, identity: &str, request: &SessionRequest) -> Result<()> {
        validate_request(request)?;
        let key = request.key(RateLimitAction::PasswordReset)?;
        let policy = self.limiter.policy(RateLimitAction::PasswordReset);
        let details = serde_json::json!({ "identity": identity });

        let status = self.limiter.try_acquire(&key, &policy).await?;
        if status.blocked {
            self.audit.dispatch(
                None,
                AuditAction::PasswordResetRequest,
                request
                    .audit(Outcome::Blocked)
                    .failed_attempts(status.attempts)
                    .details(details),
            );
            return Err(status.into_error());
        }

        self.audit.dispatch(
            None,
            AuditAction::PasswordResetRequest,
            request.audit(Outcome::Success).details(details),
        );
        Ok(())
    }
}

fn validate_request(request: &SessionRequest) -> Result<()> {
    request
        .validate()
        .map_err(|e| AppError::Validation(format!("invalid request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_validation() {
        assert!(validate_request(&SessionRequest::new("203.0.113.7", Some("curl/8"))).is_ok());
        assert!(validate_request(&SessionRequest::new("", None)).is_err());
        assert!(validate_request(&SessionRequest::new("x".repeat(65), None)).is_err());
    }

    #[test]
    fn test_request_audit_context() {
        let mut request = SessionRequest::new("203.0.113.7", Some("curl/8"));
        request.session_id = Some("abc".to_string());

        let ctx = request.audit(Outcome::Failed);
        assert_eq!(ctx.origin.as_deref(), Some("203.0.113.7"));
        assert_eq!(ctx.user_agent.as_deref(), Some("curl/8"));
        assert_eq!(ctx.session_id.as_deref(), Some("abc"));
        assert_eq!(ctx.outcome, Outcome::Failed);
    }
}

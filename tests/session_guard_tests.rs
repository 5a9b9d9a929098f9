//! 会话守卫端到端流程测试

use chrono::Duration;
use futures::future::join_all;
use session_guard::{
    clock::Clock,
    error::{AppError, Result},
    models::{audit::*, rate_limit::RateLimitAction},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

mod common;
use common::{request, wait_for_events, Harness, SplitHarness, ATTACKER_ORIGIN, STORE_TIMEOUT};

async fn wrong_password() -> Result<i64> {
    Err(AppError::Unauthorized)
}

/// 记录凭据校验次数，并模拟较慢的校验
async fn slow_wrong_password(checked: Arc<AtomicUsize>) -> Result<i64> {
    checked.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    Err(AppError::Unauthorized)
}

fn authenticated(subject_id: i64) -> impl FnOnce() -> std::future::Ready<Result<i64>> {
    move || std::future::ready(Ok(subject_id))
}

#[tokio::test]
async fn test_brute_force_is_blocked_and_audited() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request(ATTACKER_ORIGIN);

    // 10 分钟内 5 次失败登录
    for _ in 0..5 {
        let err = guard.login("alice", &req, wrong_password).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));
        h.clock.advance(Duration::minutes(2));
    }

    let status = h
        .limiter
        .check(ATTACKER_ORIGIN, RateLimitAction::Login, 15, 5)
        .await
        .unwrap();
    assert!(status.blocked);
    assert_eq!(status.attempts, 5);

    // 第 6 次直接被拦截，不再校验凭据
    let err = guard
        .login("alice", &req, authenticated(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RateLimited { attempts: 5, .. }));

    let violation = h
        .audit
        .record(
            None,
            AuditAction::SecurityViolation,
            AuditContext::with_outcome(Outcome::Blocked).origin(ATTACKER_ORIGIN),
        )
        .await
        .unwrap();

    handle.shutdown().await;

    let events = h
        .audit
        .by_origin(ATTACKER_ORIGIN, Timeframe::last(Duration::hours(1), h.clock.now()))
        .await
        .unwrap();
    assert_eq!(events.len(), 7);

    let failed: Vec<_> = events
        .iter()
        .filter(|e| e.action == AuditAction::LoginFailed)
        .collect();
    assert_eq!(failed.len(), 5);
    assert!(failed.iter().all(|e| e.risk_level >= RiskLevel::High));

    let blocked = events
        .iter()
        .find(|e| e.action == AuditAction::LoginAttempt)
        .unwrap();
    assert_eq!(blocked.outcome, Outcome::Blocked);
    assert_eq!(blocked.risk_level, RiskLevel::High);

    let critical = events.iter().find(|e| e.id == violation).unwrap();
    assert_eq!(critical.risk_level, RiskLevel::Critical);
}

#[tokio::test]
async fn test_successful_login_resets_counter_and_flags_new_location() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request("198.51.100.20");

    for _ in 0..3 {
        let _ = guard.login("bob", &req, wrong_password).await;
    }

    let token = guard.login("bob", &req, authenticated(11)).await.unwrap();
    assert_eq!(token.subject_id, 11);
    assert_eq!(h.tokens.verify(&token.secret).await.unwrap().subject_id, 11);

    let status = h
        .limiter
        .check_action("198.51.100.20", RateLimitAction::Login)
        .await
        .unwrap();
    assert_eq!(status.attempts, 0);

    wait_for_events(&h.store, 4).await;
    guard.login("bob", &req, authenticated(11)).await.unwrap();
    handle.shutdown().await;

    let logins = h
        .audit
        .by_actor(
            11,
            &AuditFilters {
                action: Some(AuditAction::LoginSuccess),
                ..AuditFilters::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(logins.total, 2);

    let mut risks: Vec<_> = logins.events.iter().map(|e| e.risk_level).collect();
    risks.sort();
    // 首次来源为 Medium，再次登录为 Low
    assert_eq!(risks, vec![RiskLevel::Low, RiskLevel::Medium]);
}

#[tokio::test]
async fn test_refresh_rotates_and_detects_reuse() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request("198.51.100.30");

    let first = guard.login("carol", &req, authenticated(21)).await.unwrap();
    let second = guard.refresh(&first.secret, &req).await.unwrap();
    assert_eq!(second.subject_id, 21);

    let err = guard.refresh(&first.secret, &req).await.unwrap_err();
    assert!(matches!(err, AppError::TokenRevoked));
    assert_eq!(err.code(), 401);

    handle.shutdown().await;

    let suspicious = h
        .audit
        .suspicious(Timeframe::last(Duration::hours(1), h.clock.now()))
        .await
        .unwrap();
    assert_eq!(suspicious.len(), 1);
    assert_eq!(suspicious[0].action, AuditAction::SecurityViolation);
    assert_eq!(suspicious[0].risk_level, RiskLevel::Critical);
}

#[tokio::test]
async fn test_refresh_with_expired_token_is_audited() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request("198.51.100.31");

    let token = guard.login("dave", &req, authenticated(22)).await.unwrap();
    h.clock.advance(Duration::days(8));

    let err = guard.refresh(&token.secret, &req).await.unwrap_err();
    assert!(matches!(err, AppError::TokenExpired));
    assert_eq!(err.user_message(), "Invalid session");

    let unknown = guard.refresh(&"a".repeat(64), &req).await.unwrap_err();
    assert!(matches!(unknown, AppError::TokenNotFound));

    handle.shutdown().await;

    let events = h
        .audit
        .by_origin("198.51.100.31", Timeframe::last(Duration::hours(1), h.clock.now()))
        .await
        .unwrap();
    assert!(events.iter().any(|e| e.action == AuditAction::SessionExpired));
    assert!(events
        .iter()
        .any(|e| e.action == AuditAction::LoginAttempt && e.outcome == Outcome::Failed));

    let status = h
        .limiter
        .check_action("198.51.100.31", RateLimitAction::Refresh)
        .await
        .unwrap();
    assert_eq!(status.attempts, 2);
}

#[tokio::test]
async fn test_logout_and_logout_all() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request("198.51.100.40");

    let a = guard.login("erin", &req, authenticated(31)).await.unwrap();
    let b = guard.login("erin", &req, authenticated(31)).await.unwrap();

    guard.logout(&a.secret, &req).await.unwrap();
    guard.logout(&a.secret, &req).await.unwrap();
    assert!(matches!(h.tokens.verify(&a.secret).await, Err(AppError::TokenRevoked)));
    assert!(h.tokens.verify(&b.secret).await.is_ok());

    assert_eq!(guard.logout_all(31, &req).await.unwrap(), 1);
    assert!(matches!(h.tokens.verify(&b.secret).await, Err(AppError::TokenRevoked)));

    handle.shutdown().await;

    let logouts = h
        .audit
        .by_actor(
            31,
            &AuditFilters {
                action: Some(AuditAction::Logout),
                ..AuditFilters::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    // 第二次登出时令牌已撤销，事件不带主体
    assert_eq!(logouts.total, 2);
}

#[tokio::test]
async fn test_password_reset_has_its_own_budget() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request(ATTACKER_ORIGIN);

    for _ in 0..3 {
        guard.request_password_reset("frank@example.com", &req).await.unwrap();
    }
    let err = guard
        .request_password_reset("frank@example.com", &req)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::RateLimited { attempts: 3, .. }));

    // 登录配额不受影响
    let token = guard.login("frank", &req, authenticated(41)).await;
    assert!(token.is_ok());

    h.clock.advance(Duration::minutes(61));
    assert!(guard
        .request_password_reset("frank@example.com", &req)
        .await
        .is_ok());

    handle.shutdown().await;
}

#[tokio::test]
async fn test_refresh_fails_closed_on_store_outage() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let req = request("198.51.100.50");

    let token = guard.login("gina", &req, authenticated(51)).await.unwrap();

    h.store.set_unavailable(true);
    // 限流放行，但令牌校验失败即拒绝
    let err = guard.refresh(&token.secret, &req).await.unwrap_err();
    assert!(err.is_store_unavailable());
    h.store.set_unavailable(false);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_invalid_request_is_rejected() {
    let h = Harness::new();
    let (guard, handle) = h.guard();

    let err = guard
        .login("x", &request(""), authenticated(1))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_cannot_exceed_attempt_budget() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let guard = Arc::new(guard);
    let checked = Arc::new(AtomicUsize::new(0));

    let logins = (0..30).map(|_| {
        let guard = guard.clone();
        let checked = checked.clone();
        tokio::spawn(async move {
            let req = request(ATTACKER_ORIGIN);
            guard
                .login("alice", &req, move || slow_wrong_password(checked))
                .await
        })
    });
    let results: Vec<_> = join_all(logins)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // 默认策略 5 次 / 15 分钟：只有 5 个请求能走到凭据校验
    assert_eq!(checked.load(Ordering::SeqCst), 5);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AppError::Unauthorized)))
            .count(),
        5
    );
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AppError::RateLimited { .. })))
            .count(),
        25
    );

    drop(guard);
    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_password_resets_cannot_exceed_budget() {
    let h = Harness::new();
    let (guard, handle) = h.guard();
    let guard = Arc::new(guard);

    let resets = (0..12).map(|_| {
        let guard = guard.clone();
        tokio::spawn(async move {
            guard
                .request_password_reset("frank@example.com", &request(ATTACKER_ORIGIN))
                .await
        })
    });
    let accepted = join_all(resets)
        .await
        .into_iter()
        .filter(|joined| matches!(joined, Ok(Ok(()))))
        .count();
    assert_eq!(accepted, 3);

    drop(guard);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_slow_audit_store_does_not_delay_login() {
    let h = SplitHarness::new(std::time::Duration::from_millis(1000));
    h.audit_store
        .set_latency(Some(std::time::Duration::from_millis(900)));
    let (guard, handle) = h.guard();
    let req = request("198.51.100.60");

    let started = std::time::Instant::now();
    let token = guard.login("hank", &req, authenticated(61)).await.unwrap();
    assert!(started.elapsed() < std::time::Duration::from_millis(300));
    assert_eq!(token.subject_id, 61);

    // 来源判断在后台完成，首次来源仍被标记
    handle.shutdown().await;
    h.audit_store.set_latency(None);

    let logins = h
        .audit
        .by_actor(61, &AuditFilters::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(logins.total, 1);
    assert_eq!(logins.events[0].action, AuditAction::LoginSuccess);
    assert_eq!(logins.events[0].risk_level, RiskLevel::Medium);
}

#[tokio::test]
async fn test_failed_issuance_keeps_failed_attempts() {
    let h = SplitHarness::new(STORE_TIMEOUT);
    let (guard, handle) = h.guard();
    let req = request("198.51.100.70");

    for _ in 0..2 {
        let _ = guard.login("ivy", &req, wrong_password).await;
    }

    h.token_store.set_unavailable(true);
    let err = guard.login("ivy", &req, authenticated(71)).await.unwrap_err();
    assert!(err.is_store_unavailable());

    let status = h
        .limiter
        .check_action("198.51.100.70", RateLimitAction::Login)
        .await
        .unwrap();
    assert_eq!(status.attempts, 3);

    h.token_store.set_unavailable(false);
    guard.login("ivy", &req, authenticated(71)).await.unwrap();
    let status = h
        .limiter
        .check_action("198.51.100.70", RateLimitAction::Login)
        .await
        .unwrap();
    assert_eq!(status.attempts, 0);

    handle.shutdown().await;
}

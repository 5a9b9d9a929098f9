//! 刷新令牌生命周期测试

use chrono::Duration;
use futures::future::join_all;
use session_guard::error::AppError;

mod common;
use common::Harness;

#[tokio::test]
async fn test_issue_rotate_revoke_all_scenario() {
    let h = Harness::new();

    let a = h.tokens.issue(42).await.unwrap();
    let b = h.tokens.rotate(&a.secret).await.unwrap();
    assert_ne!(a.secret, b.secret);
    assert_eq!(b.subject_id, 42);

    assert!(matches!(h.tokens.verify(&a.secret).await, Err(AppError::TokenRevoked)));
    assert_eq!(h.tokens.verify(&b.secret).await.unwrap().subject_id, 42);

    assert_eq!(h.tokens.revoke_all(42).await.unwrap(), 1);
    assert!(matches!(h.tokens.verify(&b.secret).await, Err(AppError::TokenRevoked)));
}

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let h = Harness::new();
    let token = h.tokens.issue(1).await.unwrap();

    h.tokens.revoke(&token.secret).await.unwrap();
    h.tokens.revoke(&token.secret).await.unwrap();
    assert!(matches!(h.tokens.verify(&token.secret).await, Err(AppError::TokenRevoked)));

    // 不存在的令牌同样不报错
    h.tokens.revoke(&"f".repeat(64)).await.unwrap();
}

#[tokio::test]
async fn test_revoke_all_only_touches_subject() {
    let h = Harness::new();
    let mine = h.tokens.issue(1).await.unwrap();
    h.tokens.issue(1).await.unwrap();
    let theirs = h.tokens.issue(2).await.unwrap();

    assert_eq!(h.tokens.revoke_all(1).await.unwrap(), 2);
    assert_eq!(h.tokens.revoke_all(1).await.unwrap(), 0);

    assert!(h.tokens.verify(&mine.secret).await.is_err());
    assert!(h.tokens.verify(&theirs.secret).await.is_ok());
}

#[tokio::test]
async fn test_expiry_is_fixed_at_issuance() {
    let h = Harness::new();
    let a = h.tokens.issue(5).await.unwrap();

    h.clock.advance(Duration::days(3));
    let b = h.tokens.rotate(&a.secret).await.unwrap();
    // 新令牌从轮换时刻起算，旧令牌的过期时间不变
    assert_eq!(b.expires_at, a.expires_at + Duration::days(3));

    h.clock.advance(Duration::days(7));
    assert!(matches!(h.tokens.verify(&b.secret).await, Err(AppError::TokenExpired)));
    assert!(matches!(h.tokens.verify(&a.secret).await, Err(AppError::TokenRevoked)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rotation_succeeds_exactly_once() {
    let h = Harness::new();
    let token = h.tokens.issue(42).await.unwrap();

    let attempts = (0..8).map(|_| {
        let tokens = h.tokens.clone();
        let secret = token.secret.clone();
        tokio::spawn(async move { tokens.rotate(&secret).await })
    });

    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, AppError::TokenRevoked)));

    assert_eq!(h.tokens.verify(&winners[0].secret).await.unwrap().subject_id, 42);
    assert_eq!(h.store.token_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_verify_after_revoke_fails_concurrently() {
    let h = Harness::new();
    let token = h.tokens.issue(7).await.unwrap();
    h.tokens.revoke(&token.secret).await.unwrap();

    let checks = (0..16).map(|_| h.tokens.verify(&token.secret));
    for result in join_all(checks).await {
        assert!(matches!(result, Err(AppError::TokenRevoked)));
    }
}

#[tokio::test]
async fn test_rotating_revoked_token_reports_revoked() {
    let h = Harness::new();
    let a = h.tokens.issue(3).await.unwrap();
    h.tokens.rotate(&a.secret).await.unwrap();

    let err = h.tokens.rotate(&a.secret).await.unwrap_err();
    assert!(matches!(err, AppError::TokenRevoked));
    assert_eq!(err.user_message(), "Invalid session");
}

#[tokio::test]
async fn test_token_service_fails_closed() {
    let h = Harness::new();
    let token = h.tokens.issue(9).await.unwrap();

    h.store.set_latency(Some(common::STORE_TIMEOUT * 2));
    let err = h.tokens.verify(&token.secret).await.unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));

    h.store.set_latency(None);
    h.store.set_unavailable(true);
    assert!(h.tokens.rotate(&token.secret).await.unwrap_err().is_store_unavailable());
    assert!(h.tokens.revoke(&token.secret).await.unwrap_err().is_store_unavailable());

    h.store.set_unavailable(false);
    assert!(h.tokens.verify(&token.secret).await.is_ok());
}

//! In-memory store (内存存储)
//!
//! 实现全部存储 trait，用于测试与本地开发。支持故障注入（不可用 / 延迟），
//! 用于验证超时与降级策略。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use super::{AuditStore, RateLimitStore, TokenStore, WindowSnapshot};
use crate::error::{AppError, Result};
use crate::models::audit::{
    ActionOutcomeStats, AuditAction, AuditEvent, AuditFilters, Outcome, Page, SecurityAnalytics,
    Timeframe,
};
use crate::models::rate_limit::RateLimitKey;
use crate::models::token::{RefreshToken, SubjectId};

/// 单个限流键的时间戳队列
type AttemptLog = Arc<Mutex<VecDeque<DateTime<Utc>>>>;

#[derive(Default)]
pub struct MemoryStore {
    /// token_hash -> record
    tokens: Mutex<HashMap<String, RefreshToken>>,
    /// 每个限流键一把锁，键之间互不阻塞
    attempts: DashMap<RateLimitKey, AttemptLog>,
    events: RwLock<Vec<AuditEvent>>,
    unavailable: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟存储故障：之后的所有调用返回 StoreUnavailable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// 模拟慢存储：每次调用前先等待
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// 当前保存的审计事件数量
    pub fn event_count(&self) -> usize {
        self.events.read().map(|events| events.len()).unwrap_or(0)
    }

    /// 当前保存的令牌数量
    pub fn token_count(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or(0)
    }

    async fn gate(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::store_unavailable("memory store marked unavailable"));
        }
        Ok(())
    }

    fn tokens(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, RefreshToken>>> {
        self.tokens
            .lock()
            .map_err(|_| AppError::internal_error("token map lock poisoned"))
    }

    fn attempt_log(&self, key: &RateLimitKey) -> AttemptLog {
        self.attempts
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    fn read_events<T>(&self, f: impl FnOnce(&[AuditEvent]) -> T) -> Result<T> {
        let events = self
            .events
            .read()
            .map_err(|_| AppError::internal_error("audit log lock poisoned"))?;
        Ok(f(&events))
    }
}

/// 清理窗口起点之前的记录
fn purge_before(log: &mut VecDeque<DateTime<Utc>>, window_start: DateTime<Utc>) {
    while let Some(&front) = log.front() {
        if front >= window_start {
            break;
        }
        log.pop_front();
    }
}

/// 按时间有序插入（时钟回拨时仍保持升序）
fn insert_ordered(log: &mut VecDeque<DateTime<Utc>>, at: DateTime<Utc>) {
    match log.back() {
        Some(&last) if last > at => {
            let index = log.partition_point(|t| *t <= at);
            log.insert(index, at);
        }
        _ => log.push_back(at),
    }
}

fn newest_first(mut events: Vec<AuditEvent>) -> Vec<AuditEvent> {
    events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
    events
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: &RefreshToken) -> Result<()> {
        self.gate().await?;
        let mut tokens = self.tokens()?;
        if tokens.contains_key(&token.token_hash) {
            return Err(AppError::Conflict("duplicate refresh token".to_string()));
        }
        tokens.insert(token.token_hash.clone(), token.clone());
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        self.gate().await?;
        Ok(self.tokens()?.get(token_hash).cloned())
    }

    async fn revoke_if_active(&self, token_hash: &str, now: DateTime<Utc>) -> Result<bool> {
        self.gate().await?;
        let mut tokens = self.tokens()?;
        match tokens.get_mut(token_hash) {
            Some(token) if !token.revoked => {
                token.revoked = true;
                token.revoked_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn rotate(
        &self,
        old_hash: &str,
        now: DateTime<Utc>,
        replacement: &RefreshToken,
    ) -> Result<bool> {
        self.gate().await?;
        // 检查、撤销、插入都在同一把锁内完成
        let mut tokens = self.tokens()?;
        if tokens.contains_key(&replacement.token_hash) {
            return Err(AppError::Conflict("duplicate refresh token".to_string()));
        }
        match tokens.get_mut(old_hash) {
            Some(old) if !old.revoked && now < old.expires_at => {
                old.revoked = true;
                old.revoked_at = Some(now);
            }
            _ => return Ok(false),
        }
        tokens.insert(replacement.token_hash.clone(), replacement.clone());
        Ok(true)
    }

    async fn revoke_all_for_subject(
        &self,
        subject_id: SubjectId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.gate().await?;
        let mut tokens = self.tokens()?;
        let mut revoked = 0;
        for token in tokens
            .values_mut()
            .filter(|t| t.subject_id == subject_id && !t.revoked)
        {
            token.revoked = true;
            token.revoked_at = Some(now);
            revoked += 1;
        }
        Ok(revoked)
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.gate().await?;
        let mut tokens = self.tokens()?;
        let before = tokens.len();
        tokens.retain(|_, t| {
            let expired = t.expires_at < cutoff;
            let revoked = t.revoked_at.map_or(false, |at| at < cutoff);
            !(expired || revoked)
        });
        Ok((before - tokens.len()) as u64)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn append(&self, key: &RateLimitKey, at: DateTime<Utc>) -> Result<()> {
        self.gate().await?;
        let log = self.attempt_log(key);
        let mut log = log
            .lock()
            .map_err(|_| AppError::internal_error("attempt log lock poisoned"))?;
        insert_ordered(&mut log, at);
        Ok(())
    }

    async fn window(
        &self,
        key: &RateLimitKey,
        window_start: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        self.gate().await?;
        let log = self.attempt_log(key);
        let mut log = log
            .lock()
            .map_err(|_| AppError::internal_error("attempt log lock poisoned"))?;
        purge_before(&mut log, window_start);
        Ok(log.iter().copied().collect())
    }

    async fn append_if_below(
        &self,
        key: &RateLimitKey,
        at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<WindowSnapshot> {
        self.gate().await?;
        let log = self.attempt_log(key);
        let mut log = log
            .lock()
            .map_err(|_| AppError::internal_error("attempt log lock poisoned"))?;
        purge_before(&mut log, window_start);
        let timestamps: Vec<DateTime<Utc>> = log.iter().copied().collect();
        let admitted = (timestamps.len() as u64) < max_attempts as u64;
        if admitted {
            insert_ordered(&mut log, at);
        }
        Ok(WindowSnapshot {
            timestamps,
            admitted,
        })
    }

    async fn clear(&self, key: &RateLimitKey) -> Result<u64> {
        self.gate().await?;
        let Some(log) = self.attempts.get(key).map(|entry| entry.clone()) else {
            return Ok(0);
        };
        let mut log = log
            .lock()
            .map_err(|_| AppError::internal_error("attempt log lock poisoned"))?;
        let cleared = log.len() as u64;
        log.clear();
        Ok(cleared)
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_event(&self, event: &AuditEvent) -> Result<()> {
        self.gate().await?;
        let mut events = self
            .events
            .write()
            .map_err(|_| AppError::internal_error("audit log lock poisoned"))?;
        if events.iter().any(|e| e.id == event.id) {
            return Err(AppError::Conflict(format!("audit event {} exists", event.id)));
        }
        events.push(event.clone());
        Ok(())
    }

    async fn events_by_subject(
        &self,
        subject_id: SubjectId,
        filters: &AuditFilters,
        page: Page,
    ) -> Result<Vec<AuditEvent>> {
        self.gate().await?;
        let matched = self.read_events(|events| {
            events
                .iter()
                .filter(|e| e.subject_id == Some(subject_id) && filters.matches(e))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        Ok(newest_first(matched)
            .into_iter()
            .skip(page.offset.max(0) as usize)
            .take(page.limit.max(0) as usize)
            .collect())
    }

    async fn count_by_subject(
        &self,
        subject_id: SubjectId,
        filters: &AuditFilters,
    ) -> Result<i64> {
        self.gate().await?;
        self.read_events(|events| {
            events
                .iter()
                .filter(|e| e.subject_id == Some(subject_id) && filters.matches(e))
                .count() as i64
        })
    }

    async fn events_by_origin(
        &self,
        origin: &str,
        timeframe: Timeframe,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        self.gate().await?;
        let matched = self.read_events(|events| {
            events
                .iter()
                .filter(|e| e.origin.as_deref() == Some(origin) && timeframe.contains(e.occurred_at))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        Ok(newest_first(matched).into_iter().take(limit.max(0) as usize).collect())
    }

    async fn suspicious_events(
        &self,
        timeframe: Timeframe,
        limit: i64,
    ) -> Result<Vec<AuditEvent>> {
        self.gate().await?;
        let matched = self.read_events(|events| {
            events
                .iter()
                .filter(|e| e.is_suspicious() && timeframe.contains(e.occurred_at))
                .cloned()
                .collect::<Vec<_>>()
        })?;
        Ok(newest_first(matched).into_iter().take(limit.max(0) as usize).collect())
    }

    async fn analytics(&self, timeframe: Timeframe) -> Result<SecurityAnalytics> {
        self.gate().await?;
        self.read_events(|events| {
            #[derive(Default)]
            struct Bucket<'a> {
                count: i64,
                actors: HashSet<SubjectId>,
                origins: HashSet<&'a str>,
            }

            let mut groups: BTreeMap<(&'static str, &'static str), (AuditAction, Outcome, Bucket)> =
                BTreeMap::new();
            let mut actors = HashSet::new();
            let mut origins = HashSet::new();
            let mut total = 0;
            let mut suspicious = 0;

            for event in events.iter().filter(|e| timeframe.contains(e.occurred_at)) {
                total += 1;
                if event.is_suspicious() {
                    suspicious += 1;
                }
                let (_, _, bucket) = groups
                    .entry((event.action.as_str(), event.outcome.as_str()))
                    .or_insert_with(|| (event.action, event.outcome, Bucket::default()));
                bucket.count += 1;
                if let Some(subject) = event.subject_id {
                    bucket.actors.insert(subject);
                    actors.insert(subject);
                }
                if let Some(origin) = event.origin.as_deref() {
                    bucket.origins.insert(origin);
                    origins.insert(origin);
                }
            }

            SecurityAnalytics {
                timeframe,
                total_events: total,
                suspicious_events: suspicious,
                distinct_actors: actors.len() as i64,
                distinct_origins: origins.len() as i64,
                breakdown: groups
                    .into_values()
                    .map(|(action, outcome, bucket)| ActionOutcomeStats {
                        action,
                        outcome,
                        count: bucket.count,
                        distinct_actors: bucket.actors.len() as i64,
                        distinct_origins: bucket.origins.len() as i64,
                    })
                    .collect(),
            }
        })
    }

    async fn origin_seen(&self, subject_id: SubjectId, origin: &str) -> Result<bool> {
        self.gate().await?;
        self.read_events(|events| {
            events.iter().any(|e| {
                e.subject_id == Some(subject_id)
                    && e.action == AuditAction::LoginSuccess
                    && e.origin.as_deref() == Some(origin)
            })
        })
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.gate().await?;
        let mut events = self
            .events
            .write()
            .map_err(|_| AppError::internal_error("audit log lock poisoned"))?;
        let before = events.len();
        events.retain(|e| e.occurred_at >= cutoff);
        Ok((before - events.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::RiskLevel;
    use crate::models::rate_limit::RateLimitAction;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn token(hash: &str, subject_id: SubjectId, now: DateTime<Utc>) -> RefreshToken {
        RefreshToken {
            id: Uuid::new_v4(),
            token_hash: hash.to_string(),
            subject_id,
            issued_at: now,
            expires_at: now + ChronoDuration::days(7),
            revoked: false,
            revoked_at: None,
            rotated_from: None,
            origin: None,
            user_agent: None,
        }
    }

    fn event(action: AuditAction, outcome: Outcome, at: DateTime<Utc>) -> AuditEvent {
        AuditEvent {
            id: Uuid::new_v4(),
            subject_id: Some(1),
            action,
            origin: Some("198.51.100.1".to_string()),
            user_agent: None,
            occurred_at: at,
            outcome,
            risk_level: RiskLevel::Low,
            context: serde_json::Value::Null,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_token_hash_conflicts() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_token(&token("h1", 1, now)).await.unwrap();
        let err = store.insert_token(&token("h1", 2, now)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_conditional_revoke_reports_change_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_token(&token("h1", 1, now)).await.unwrap();

        assert!(store.revoke_if_active("h1", now).await.unwrap());
        assert!(!store.revoke_if_active("h1", now).await.unwrap());
        assert!(!store.revoke_if_active("missing", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_rotate_refuses_expired_token() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert_token(&token("old", 1, now)).await.unwrap();

        let later = now + ChronoDuration::days(8);
        let rotated = store
            .rotate("old", later, &token("new", 1, later))
            .await
            .unwrap();

        assert!(!rotated);
        assert!(store.find_by_hash("new").await.unwrap().is_none());
        assert!(!store.find_by_hash("old").await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn test_window_purges_lazily() {
        let store = MemoryStore::new();
        let key = RateLimitKey::new("198.51.100.1", RateLimitAction::Login).unwrap();
        let now = Utc::now();

        store.append(&key, now - ChronoDuration::minutes(20)).await.unwrap();
        store.append(&key, now - ChronoDuration::minutes(5)).await.unwrap();

        let window = store
            .window(&key, now - ChronoDuration::minutes(15))
            .await
            .unwrap();
        assert_eq!(window, vec![now - ChronoDuration::minutes(5)]);
    }

    #[tokio::test]
    async fn test_out_of_order_append_stays_sorted() {
        let store = MemoryStore::new();
        let key = RateLimitKey::new("u1", RateLimitAction::Api).unwrap();
        let now = Utc::now();

        store.append(&key, now).await.unwrap();
        store.append(&key, now - ChronoDuration::seconds(30)).await.unwrap();

        let window = store.window(&key, now - ChronoDuration::minutes(1)).await.unwrap();
        assert_eq!(window, vec![now - ChronoDuration::seconds(30), now]);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);

        let err = store.find_by_hash("h").await.unwrap_err();
        assert!(err.is_store_unavailable());

        store.set_unavailable(false);
        assert!(store.find_by_hash("h").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_before_keeps_recent_events() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert_event(&event(AuditAction::Logout, Outcome::Success, now - ChronoDuration::days(100)))
            .await
            .unwrap();
        store
            .insert_event(&event(AuditAction::Logout, Outcome::Success, now))
            .await
            .unwrap();

        let deleted = store.delete_before(now - ChronoDuration::days(90)).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.event_count(), 1);
    }
}

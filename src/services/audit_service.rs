//! 审计日志服务
//!
//! [`AuditService`] 负责分级、持久化与查询；[`AuditDispatcher`] 在请求路径上
//! 以非阻塞方式投递事件，写入失败只记录日志，不影响调用方。

use crate::{
    clock::Clock,
    error::{AppError, Result},
    models::{audit::*, token::SubjectId},
    repository::{with_timeout, AuditStore},
    services::risk,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;
use validator::Validate;

/// 单次来源/可疑事件查询的最大返回条数
pub const MAX_QUERY_ROWS: i64 = 1000;

/// 按主体分页查询的结果
#[derive(Debug, Clone)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    pub total: i64,
}

pub struct AuditService {
    store: Arc<dyn AuditStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    retention: chrono::Duration,
}

impl AuditService {
    pub fn new(
        store: Arc<dyn AuditStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
        retention_days: u32,
    ) -> Self {
        Self {
            store,
            clock,
            timeout,
            retention: chrono::Duration::days(retention_days as i64),
        }
    }

    /// 构建事件：生成 id、计算风险等级（不访问存储）
    pub fn build_event(
        &self,
        subject_id: Option<SubjectId>,
        action: AuditAction,
        context: AuditContext,
    ) -> Result<AuditEvent> {
        context
            .validate()
            .map_err(|e| AppError::Validation(format!("invalid audit context: {}", e)))?;

        let risk_level = risk::classify(action, &context);
        let payload = serde_json::json!({
            "failed_attempts": context.failed_attempts,
            "new_location": context.new_location,
            "details": context.details,
        });

        Ok(AuditEvent {
            id: Uuid::new_v4(),
            subject_id,
            action,
            origin: context.origin,
            user_agent: context.user_agent,
            occurred_at: self.clock.now(),
            outcome: context.outcome,
            risk_level,
            context: payload,
            session_id: context.session_id,
        })
    }

    /// 记录审计事件并同步写入
    pub async fn record(
        &self,
        subject_id: Option<SubjectId>,
        action: AuditAction,
        context: AuditContext,
    ) -> Result<Uuid> {
        let event = self.build_event(subject_id, action, context)?;
        self.persist(&event).await?;
        Ok(event.id)
    }

    /// 写入已构建的事件
    pub async fn persist(&self, event: &AuditEvent) -> Result<()> {
        with_timeout(self.timeout, "audit.insert", self.store.insert_event(event)).await?;

        metrics::counter!("audit_events_recorded_total", "risk" => event.risk_level.as_str())
            .increment(1);
        if event.risk_level >= RiskLevel::High {
            tracing::warn!(
                event_id = %event.id,
                action = event.action.as_str(),
                outcome = event.outcome.as_str(),
                risk = event.risk_level.as_str(),
                origin = event.origin.as_deref().unwrap_or("-"),
                "High risk security event recorded"
            );
        } else {
            tracing::debug!(
                event_id = %event.id,
                action = event.action.as_str(),
                risk = event.risk_level.as_str(),
                "Security event recorded"
            );
        }
        Ok(())
    }

    /// 查询主体的审计事件（按时间倒序）
    pub async fn by_actor(
        &self,
        subject_id: SubjectId,
        filters: &AuditFilters,
        page: Page,
    ) -> Result<AuditPage> {
        page.validate()
            .map_err(|e| AppError::Validation(format!("invalid page: {}", e)))?;

        let events = with_timeout(
            self.timeout,
            "audit.by_subject",
            self.store.events_by_subject(subject_id, filters, page),
        )
        .await?;
        let total = with_timeout(
            self.timeout,
            "audit.count_by_subject",
            self.store.count_by_subject(subject_id, filters),
        )
        .await?;

        Ok(AuditPage { events, total })
    }

    /// 查询来源地址在时间范围内的事件
    pub async fn by_origin(&self, origin: &str, timeframe: Timeframe) -> Result<Vec<AuditEvent>> {
        let origin = origin.trim();
        if origin.is_empty() {
            return Err(AppError::validation("origin must not be empty"));
        }

        with_timeout(
            self.timeout,
            "audit.by_origin",
            self.store.events_by_origin(origin, timeframe, MAX_QUERY_ROWS),
        )
        .await
    }

    /// 可疑事件：High/Critical 或被拦截
    pub async fn suspicious(&self, timeframe: Timeframe) -> Result<Vec<AuditEvent>> {
        with_timeout(
            self.timeout,
            "audit.suspicious",
            self.store.suspicious_events(timeframe, MAX_QUERY_ROWS),
        )
        .await
    }

    /// 按 动作 × 结果 统计
    pub async fn security_analytics(&self, timeframe: Timeframe) -> Result<SecurityAnalytics> {
        with_timeout(self.timeout, "audit.analytics", self.store.analytics(timeframe)).await
    }

    /// 主体此前是否从该来源成功登录过
    pub async fn origin_seen(&self, subject_id: SubjectId, origin: &str) -> Result<bool> {
        with_timeout(
            self.timeout,
            "audit.origin_seen",
            self.store.origin_seen(subject_id, origin),
        )
        .await
    }

    /// 主体首次从该来源登录时标记 new_location 并提升风险等级
    ///
    /// 查询失败时保持原样，只记录告警。
    pub async fn flag_new_location(&self, event: &mut AuditEvent) {
        let (Some(subject_id), Some(origin)) = (event.subject_id, event.origin.as_deref()) else {
            return;
        };

        let seen = self.origin_seen(subject_id, origin).await;
        match seen {
            Ok(true) => {}
            Ok(false) => {
                if let Some(context) = event.context.as_object_mut() {
                    context.insert("new_location".to_string(), serde_json::Value::Bool(true));
                }
                event.risk_level = event.risk_level.max(risk::NEW_LOCATION_RISK);
            }
            Err(e) => tracing::warn!(
                event_id = %event.id,
                subject_id,
                error = %e,
                "Could not determine login origin history"
            ),
        }
    }

    /// 删除超过保留期的事件
    pub async fn purge_expired(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.retention;
        let purged = with_timeout(
            self.timeout,
            "audit.delete_before",
            self.store.delete_before(cutoff),
        )
        .await?;

        metrics::counter!("retention_purged_total", "kind" => "audit_event").increment(purged);
        Ok(purged)
    }
}

/// 队列中待写入的事件
struct Queued {
    event: AuditEvent,
    /// 写入前检查来源是否首次出现
    check_origin: bool,
}

/// 异步审计投递
///
/// 事件在调用线程上构建（id 与基础风险等级立即可得），依赖历史记录的判断与持久化
/// 交给后台任务。队列已满或已关闭时丢弃事件并计数。
///
/// 后台任务在收到 [`DispatcherHandle::shutdown`] 或全部投递端被丢弃后退出；
/// 丢弃句柄本身不会停止写入。
#[derive(Clone)]
pub struct AuditDispatcher {
    service: Arc<AuditService>,
    sender: mpsc::Sender<Queued>,
}

/// 后台写入任务句柄
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<()>,
    worker: JoinHandle<()>,
}

impl AuditDispatcher {
    /// 启动后台写入任务
    pub fn spawn(service: Arc<AuditService>, capacity: usize) -> (Self, DispatcherHandle) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let worker = tokio::spawn(drain_queue(service.clone(), receiver, shutdown_rx));

        (
            Self { service, sender },
            DispatcherHandle {
                shutdown_tx,
                worker,
            },
        )
    }

    pub fn service(&self) -> &Arc<AuditService> {
        &self.service
    }

    /// 投递事件，立即返回事件 id；事件无法构建时返回 None
    pub fn dispatch(
        &self,
        subject_id: Option<SubjectId>,
        action: AuditAction,
        context: AuditContext,
    ) -> Option<Uuid> {
        self.enqueue(subject_id, action, context, false)
    }

    /// 投递成功登录事件；是否来自新位置由后台任务在写入前判断
    pub fn dispatch_login(&self, subject_id: SubjectId, context: AuditContext) -> Option<Uuid> {
        self.enqueue(Some(subject_id), AuditAction::LoginSuccess, context, true)
    }

    fn enqueue(
        &self,
        subject_id: Option<SubjectId>,
        action: AuditAction,
        context: AuditContext,
        check_origin: bool,
    ) -> Option<Uuid> {
        let event = match self.service.build_event(subject_id, action, context) {
            Ok(event) => event,
            Err(e) => {
                metrics::counter!("audit_events_dropped_total", "reason" => "invalid").increment(1);
                tracing::warn!(action = action.as_str(), error = %e, "Audit event rejected");
                return None;
            }
        };
        let id = event.id;

        if let Err(e) = self.sender.try_send(Queued {
            event,
            check_origin,
        }) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue_full",
                mpsc::error::TrySendError::Closed(_) => "closed",
            };
            metrics::counter!("audit_events_dropped_total", "reason" => reason).increment(1);
            tracing::warn!(event_id = %id, action = action.as_str(), reason, "Audit event dropped");
        }

        Some(id)
    }
}

impl DispatcherHandle {
    /// 停止接收新事件并写完队列中剩余的事件
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.worker.await {
            tracing::error!("Audit dispatcher task failed: {}", e);
        }
    }
}

async fn drain_queue(
    service: Arc<AuditService>,
    mut receiver: mpsc::Receiver<Queued>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    tracing::debug!("Audit dispatcher started");

    loop {
        tokio::select! {
            queued = receiver.recv() => match queued {
                Some(queued) => write_event(&service, queued).await,
                None => break,
            },
            // 句柄被丢弃时 changed() 返回 Err，该分支失效，继续处理队列
            Ok(()) = shutdown_rx.changed() => break,
        }
    }

    receiver.close();
    while let Some(queued) = receiver.recv().await {
        write_event(&service, queued).await;
    }

    tracing::info!("Audit dispatcher stopped");
}

async fn write_event(service: &AuditService, queued: Queued) {
    let mut event = queued.event;
    if queued.check_origin {
        service.flag_new_location(&mut event).await;
    }

    if let Err(e) = service.persist(&event).await {
        metrics::counter!("audit_events_dropped_total", "reason" => "store_error").increment(1);
        tracing::error!(
            event_id = %event.id,
            action = event.action.as_str(),
            error = %e,
            "Failed to persist audit event"
        );
    }
}

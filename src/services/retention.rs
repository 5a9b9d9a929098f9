//! 保留期清理任务
//!
//! 定期删除超过保留期的审计事件，以及过期/撤销超过宽限期的刷新令牌。
//! 限流记录不在此清理，只在访问时惰性删除。

use crate::{
    config::AuditConfig,
    services::{AuditService, TokenService},
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// 单轮清理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub audit_events: u64,
    pub refresh_tokens: u64,
}

pub struct RetentionWorker {
    audit: Arc<AuditService>,
    tokens: Arc<TokenService>,
    interval: Duration,
    token_grace: chrono::Duration,
}

/// 后台清理任务句柄
pub struct RetentionHandle {
    shutdown_tx: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl RetentionWorker {
    pub fn new(audit: Arc<AuditService>, tokens: Arc<TokenService>, config: &AuditConfig) -> Self {
        Self {
            audit,
            tokens,
            interval: Duration::from_secs(config.sweep_interval_secs),
            token_grace: chrono::Duration::days(config.token_grace_days as i64),
        }
    }

    /// 执行一轮清理；单项失败只记录日志
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.audit.purge_expired().await {
            Ok(purged) => report.audit_events = purged,
            Err(e) => tracing::error!("Audit retention sweep failed: {}", e),
        }

        match self.tokens.purge_stale(self.token_grace).await {
            Ok(purged) => report.refresh_tokens = purged,
            Err(e) => tracing::error!("Refresh token sweep failed: {}", e),
        }

        tracing::info!(
            audit_events = report.audit_events,
            refresh_tokens = report.refresh_tokens,
            "Retention sweep completed"
        );
        report
    }

    /// 启动周期任务
    pub fn spawn(self) -> RetentionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let task = tokio::spawn(self.run(shutdown_rx));
        RetentionHandle { shutdown_tx, task }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "Retention worker started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        tracing::info!("Retention worker stopped");
    }
}

impl RetentionHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            tracing::error!("Retention worker task failed: {}", e);
        }
    }
}

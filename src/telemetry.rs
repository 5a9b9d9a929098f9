//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
///
/// RUST_LOG 优先于配置中的日志级别。重复初始化时返回错误而不是 panic。
pub fn init_telemetry(
    config: &LoggingConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let log_layer = match config.format.to_lowercase().as_str() {
        "json" => {
            // JSON 格式（生产环境）
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false)
                .boxed()
        }
        "pretty" => {
            // 美化格式（开发环境）
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(false)
                .boxed()
        }
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .try_init()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.level,
        format = %config.format,
        "Telemetry initialized"
    );
    Ok(())
}

/// 初始化指标收集器
///
/// metrics 0.24 在首次使用时创建指标，这里只登记描述信息。
pub fn init_metrics() {
    metrics::describe_counter!("session_tokens_issued_total", "Refresh tokens issued");
    metrics::describe_counter!("session_tokens_rotated_total", "Refresh tokens rotated");
    metrics::describe_counter!(
        "session_token_rejections_total",
        "Refresh tokens rejected, by reason"
    );
    metrics::describe_counter!("rate_limit_blocked_total", "Blocked attempts, by action");
    metrics::describe_counter!(
        "rate_limit_fail_open_total",
        "Requests allowed because the rate limit store was unavailable"
    );
    metrics::describe_counter!("audit_events_recorded_total", "Audit events persisted, by risk");
    metrics::describe_counter!("audit_events_dropped_total", "Audit events dropped, by reason");
    metrics::describe_counter!("retention_purged_total", "Rows removed by retention sweeps");
    metrics::describe_counter!("store_timeouts_total", "Store calls that timed out");
    tracing::debug!("Metrics initialized");
}

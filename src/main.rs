//! 会话安全维护进程
//! 执行会话表迁移，并运行保留期清理任务直到收到退出信号。
//! 认证流程由嵌入方通过库中的 SessionGuard 接入。

use session_guard::{
    clock::{Clock, SystemClock},
    config::AppConfig,
    db,
    repository::{AuditRepository, TokenRepository},
    services::{AuditService, RetentionWorker, TokenService},
    telemetry,
};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("session-guard {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境），生产环境直接设置环境变量
    if let Ok(env) = std::env::var("SG_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::dotenv().ok();
    }

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config.logging)?;
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Session guard starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;

    // 4. 存储与服务
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timeout = config.store.timeout();

    let tokens = Arc::new(TokenService::new(
        Arc::new(TokenRepository::new(db_pool.clone())),
        config.tokens.clone(),
        clock.clone(),
        timeout,
    ));
    let audit = Arc::new(AuditService::new(
        Arc::new(AuditRepository::new(db_pool.clone())),
        clock.clone(),
        timeout,
        config.audit.retention_days,
    ));

    // 5. 保留期清理
    let health = db::health_check(&db_pool).await;
    if !health.is_healthy() {
        anyhow::bail!("Session store is not healthy: {:?}", health);
    }

    let retention_handle = RetentionWorker::new(audit, tokens, &config.audit).spawn();
    tracing::info!("Session guard maintenance running");

    // 6. 等待退出信号
    shutdown_signal().await;

    retention_handle.shutdown().await;
    db_pool.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// 退出信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }
}

/// 打印帮助信息
fn print_help() {
    println!("session-guard {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: session-guard [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 SG_ 前缀的环境变量完成，例如:");
    println!("  SG_DATABASE__URL, SG_LOGGING__LEVEL, SG_AUDIT__RETENTION_DAYS");
}

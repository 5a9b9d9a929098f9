//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use crate::models::rate_limit::{RateLimitAction, RateLimitPolicy};
use config::{Config, ConfigError, Environment};
use secrecy::Secret;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    /// 最大连接数
    pub max_connections: u32,
    /// 最小连接数
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 连接最大生命周期（秒）
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// 刷新令牌有效期（秒）
    pub refresh_token_ttl_secs: u64,
    /// 令牌随机字节数（至少 32，即 256 位）
    pub secret_bytes: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            refresh_token_ttl_secs: 7 * 24 * 3600,
            secret_bytes: 32,
        }
    }
}

/// 单个动作的限流策略（配置形式）
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub window_minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSettings {
    pub login: PolicyConfig,
    pub refresh: PolicyConfig,
    pub password_reset: PolicyConfig,
    pub register: PolicyConfig,
    pub api: PolicyConfig,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            login: PolicyConfig { max_attempts: 5, window_minutes: 15 },
            refresh: PolicyConfig { max_attempts: 30, window_minutes: 15 },
            password_reset: PolicyConfig { max_attempts: 3, window_minutes: 60 },
            register: PolicyConfig { max_attempts: 5, window_minutes: 60 },
            api: PolicyConfig { max_attempts: 100, window_minutes: 1 },
        }
    }
}

impl RateLimitSettings {
    /// 获取指定动作的限流策略
    pub fn policy_for(&self, action: RateLimitAction) -> RateLimitPolicy {
        let p = match action {
            RateLimitAction::Login => self.login,
            RateLimitAction::Refresh => self.refresh,
            RateLimitAction::PasswordReset => self.password_reset,
            RateLimitAction::Register => self.register,
            RateLimitAction::Api => self.api,
        };
        RateLimitPolicy::from_minutes(p.max_attempts, p.window_minutes)
    }

    fn all(&self) -> [(&'static str, PolicyConfig); 5] {
        [
            ("login", self.login),
            ("refresh", self.refresh),
            ("password_reset", self.password_reset),
            ("register", self.register),
            ("api", self.api),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// 审计事件保留天数
    pub retention_days: u32,
    /// 保留期清理间隔（秒）
    pub sweep_interval_secs: u64,
    /// 异步写入队列容量
    pub queue_capacity: usize,
    /// 过期/撤销令牌在清理前的保留天数
    pub token_grace_days: u32,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            sweep_interval_secs: 3600,
            queue_capacity: 1024,
            token_grace_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// 单次存储调用超时（毫秒）
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub tokens: TokenConfig,
    pub rate_limit: RateLimitSettings,
    pub audit: AuditConfig,
    pub store: StoreConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        // 添加默认配置
        settings = settings
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("tokens.refresh_token_ttl_secs", 604800)?
            .set_default("tokens.secret_bytes", 32)?
            .set_default("rate_limit.login.max_attempts", 5)?
            .set_default("rate_limit.login.window_minutes", 15)?
            .set_default("rate_limit.refresh.max_attempts", 30)?
            .set_default("rate_limit.refresh.window_minutes", 15)?
            .set_default("rate_limit.password_reset.max_attempts", 3)?
            .set_default("rate_limit.password_reset.window_minutes", 60)?
            .set_default("rate_limit.register.max_attempts", 5)?
            .set_default("rate_limit.register.window_minutes", 60)?
            .set_default("rate_limit.api.max_attempts", 100)?
            .set_default("rate_limit.api.window_minutes", 1)?
            .set_default("audit.retention_days", 90)?
            .set_default("audit.sweep_interval_secs", 3600)?
            .set_default("audit.queue_capacity", 1024)?
            .set_default("audit.token_grace_days", 7)?
            .set_default("store.timeout_ms", 2000)?;

        // 从环境变量加载配置（前缀为 SG_）
        settings = settings.add_source(
            Environment::with_prefix("SG")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        // 验证配置
        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 验证日志级别
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        // 验证日志格式
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        // 验证数据库连接池配置
        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        if self.tokens.refresh_token_ttl_secs < 3600 || self.tokens.refresh_token_ttl_secs > 2592000
        {
            return Err(ConfigError::Message(
                "refresh_token_ttl_secs must be between 3600 and 2592000 (1 hour to 30 days)"
                    .to_string(),
            ));
        }

        if self.tokens.secret_bytes < 32 || self.tokens.secret_bytes > 128 {
            return Err(ConfigError::Message(
                "secret_bytes must be between 32 and 128".to_string(),
            ));
        }

        for (name, policy) in self.rate_limit.all() {
            if policy.max_attempts == 0 || policy.window_minutes == 0 {
                return Err(ConfigError::Message(format!(
                    "rate_limit.{} requires max_attempts > 0 and window_minutes > 0",
                    name
                )));
            }
        }

        if self.audit.retention_days == 0 {
            return Err(ConfigError::Message(
                "audit.retention_days must be > 0".to_string(),
            ));
        }

        if self.audit.queue_capacity == 0 || self.audit.sweep_interval_secs == 0 {
            return Err(ConfigError::Message(
                "audit.queue_capacity and audit.sweep_interval_secs must be > 0".to_string(),
            ));
        }

        if self.store.timeout_ms < 10 || self.store.timeout_ms > 60_000 {
            return Err(ConfigError::Message(
                "store.timeout_ms must be between 10 and 60000".to_string(),
            ));
        }

        Ok(())
    }
}

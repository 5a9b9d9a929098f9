//! 会话安全核心库
//! 刷新令牌生命周期、滑动窗口限流、带风险分级的审计日志

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;
pub mod telemetry;

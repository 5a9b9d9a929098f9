//! 数据模型模块
//! 令牌、限流、审计三类领域模型

pub mod audit;
pub mod rate_limit;
pub mod token;

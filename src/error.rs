//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// 刷新令牌不存在
    #[error("Refresh token not found")]
    TokenNotFound,

    /// 刷新令牌已过期
    #[error("Refresh token expired")]
    TokenExpired,

    /// 刷新令牌已撤销
    #[error("Refresh token revoked")]
    TokenRevoked,

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Rate limit exceeded ({attempts} attempts, resets at {reset_at})")]
    RateLimited {
        attempts: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::TokenNotFound
            | AppError::TokenExpired
            | AppError::TokenRevoked
            | AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    ///
    /// 三种令牌失败对持有者呈现同一条消息，避免泄露具体原因。
    pub fn user_message(&self) -> String {
        match self {
            AppError::TokenNotFound
            | AppError::TokenExpired
            | AppError::TokenRevoked
            | AppError::Unauthorized => "Invalid session".to_string(),
            AppError::RateLimited { reset_at, .. } => {
                format!("Too many attempts, retry after {}", reset_at.to_rfc3339())
            }
            AppError::Validation(msg) => msg.clone(),
            AppError::Conflict(_) => "Conflict".to_string(),
            AppError::StoreUnavailable(_) => "Service temporarily unavailable".to_string(),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    /// 持久化协作方故障（超时、连接失败、SQL 错误）
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AppError::StoreUnavailable(_) | AppError::Database(_))
    }

    /// 是否属于令牌校验失败
    pub fn is_token_rejection(&self) -> bool {
        matches!(
            self,
            AppError::TokenNotFound | AppError::TokenExpired | AppError::TokenRevoked
        )
    }

    /// 距离限流重置的秒数（向上取整，至少 1 秒）
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            AppError::RateLimited { reset_at, .. } => {
                let millis = (*reset_at - now).num_milliseconds().max(0) as u64;
                Some(millis.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }

    // 便捷方法
    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn store_unavailable(msg: &str) -> Self {
        AppError::StoreUnavailable(msg.to_string())
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();
        let retry_after = self.retry_after_secs(Utc::now());

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        // 客户端错误只记 warn，服务端错误记 error
        if status.is_server_error() {
            tracing::error!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Application error"
            );
        } else {
            tracing::warn!(
                code = self.code(),
                message = %self,
                request_id = %error_response.error.request_id,
                "Request rejected"
            );
        }

        let mut response = (status, Json(error_response)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// 从 config::ConfigError 转换
impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

//! Business logic services layer

pub mod audit_service;
pub mod rate_limiter;
pub mod retention;
pub mod risk;
pub mod session_guard;
pub mod token_service;

pub use audit_service::{AuditDispatcher, AuditService, DispatcherHandle};
pub use rate_limiter::RateLimiter;
pub use retention::{RetentionHandle, RetentionWorker};
pub use session_guard::{SessionGuard, SessionRequest};
pub use token_service::TokenService;

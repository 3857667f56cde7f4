pub mod auth;
pub mod request_logger;
pub mod webhook_auth;

pub use auth::{admin_auth, AdminKey};
pub use request_logger::{request_logger_middleware, RequestLogSettings};
pub use webhook_auth::{VerifiedWebhook, WebhookSecret};

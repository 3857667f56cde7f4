use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::AppError;

/// Shared secret for administrative routes.
#[derive(Clone)]
pub struct AdminKey(pub Arc<str>);

impl AdminKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Arc::from(key.into()))
    }
}

pub async fn admin_auth(
    State(key): State<AdminKey>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    match auth_header.and_then(|auth| auth.strip_prefix("Bearer ")) {
        Some(token) if !key.0.is_empty() && token.trim() == &*key.0 => Ok(next.run(req).await),
        _ => {
            tracing::warn!(path = %req.uri().path(), "rejected admin request with missing or invalid credentials");
            Err(AppError::Unauthorized("missing or invalid admin credentials".to_string()))
        }
    }
}

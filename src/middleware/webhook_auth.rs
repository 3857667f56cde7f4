use axum::{
    async_trait,
    extract::{FromRef, FromRequest, Request},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
const MAX_WEBHOOK_BODY: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct WebhookSecret(pub Arc<str>);

impl WebhookSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Arc::from(secret.into()))
    }
}

/// Request body whose `x-signature` header matched
/// hex(HMAC-SHA256(secret, body)).
pub struct VerifiedWebhook {
    pub body: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WebhookAuthError {
    MissingSignature,
    InvalidSignatureFormat,
    InvalidSecret,
    SignatureMismatch,
}

pub fn sign_body(secret: &str, body: &[u8]) -> Result<String, WebhookAuthError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookAuthError::InvalidSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature against `body`.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> Result<(), WebhookAuthError> {
    let trimmed = signature_header.trim();
    let hex_part = trimmed.strip_prefix("sha256=").unwrap_or(trimmed);
    let expected = hex::decode(hex_part).map_err(|_| WebhookAuthError::InvalidSignatureFormat)?;

    if secret.is_empty() {
        return Err(WebhookAuthError::InvalidSecret);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookAuthError::InvalidSecret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookAuthError::SignatureMismatch)
}

impl From<WebhookAuthError> for AppError {
    fn from(err: WebhookAuthError) -> Self {
        tracing::warn!("webhook authentication failed: {:?}", err);
        match err {
            WebhookAuthError::MissingSignature => {
                AppError::Unauthorized(format!("missing {} header", SIGNATURE_HEADER))
            }
            WebhookAuthError::InvalidSignatureFormat => {
                AppError::Unauthorized("invalid signature format".to_string())
            }
            WebhookAuthError::SignatureMismatch => {
                AppError::Unauthorized("signature verification failed".to_string())
            }
            WebhookAuthError::InvalidSecret => {
                AppError::Internal("invalid webhook secret configuration".to_string())
            }
        }
    }
}

#[async_trait]
impl<S> FromRequest<S> for VerifiedWebhook
where
    WebhookSecret: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let secret = WebhookSecret::from_ref(state);

        let signature = req
            .headers()
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(WebhookAuthError::MissingSignature)?;

        let body = axum::body::to_bytes(req.into_body(), MAX_WEBHOOK_BODY)
            .await
            .map_err(|_| AppError::BadRequest("failed to read request body".to_string()))?
            .to_vec();

        verify_signature(&secret.0, &body, &signature)?;

        Ok(VerifiedWebhook { body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_round_trip() {
        let body = br#"{"events":[]}"#;
        let signature = sign_body("hook-secret", body).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_signature("hook-secret", body, &signature).is_ok());
        assert!(verify_signature("hook-secret", body, &format!("sha256={}", signature)).is_ok());
    }

    #[test]
    fn test_tampered_body_or_secret_is_rejected() {
        let signature = sign_body("hook-secret", b"payload").unwrap();
        assert_eq!(
            verify_signature("hook-secret", b"payload2", &signature),
            Err(WebhookAuthError::SignatureMismatch)
        );
        assert_eq!(
            verify_signature("other", b"payload", &signature),
            Err(WebhookAuthError::SignatureMismatch)
        );
        assert_eq!(
            verify_signature("hook-secret", b"payload", "not-hex"),
            Err(WebhookAuthError::InvalidSignatureFormat)
        );
    }
}

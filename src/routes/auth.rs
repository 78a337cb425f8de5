use std::sync::Arc;

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use crate::error::AppError;
use crate::AppState;

/// Extractor guarding cron and operator endpoints with the shared
/// `CRON_SECRET`, sent as `Authorization: Bearer <secret>`.
///
/// An unset secret rejects every request.
pub struct CronAuth;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CronAuth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.sync.cron_secret.as_deref() else {
            tracing::warn!("CRON_SECRET is not configured; rejecting cron request");
            return Err(AppError::Unauthorized);
        };

        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("Missing or invalid Authorization header");
                AppError::Unauthorized
            })?;

        if !auth_header.to_ascii_lowercase().starts_with("bearer ") {
            tracing::debug!("Authorization header doesn't start with 'Bearer '");
            return Err(AppError::Unauthorized);
        }

        let token = auth_header[7..].trim();
        if token.is_empty() || !secrets_match(token, expected) {
            tracing::debug!("Bearer token does not match CRON_SECRET");
            return Err(AppError::Unauthorized);
        }

        Ok(CronAuth)
    }
}

/// Compare without short-circuiting on the first differing byte.
fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_match_requires_exact_value() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3creT"));
        assert!(!secrets_match("s3c", "s3cret"));
        assert!(!secrets_match("", "s3cret"));
    }
}

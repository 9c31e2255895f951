//! Authentication seam
//!
//! Token verification is an external collaborator; this service only
//! needs the authenticated user id. Deployments sit behind a gateway
//! that verifies the session and forwards the id in a trusted
//! header.

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::error::HttpError;

/// The header the gateway forwards the authenticated user id in.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the requesting user from request headers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The authenticated user id; `0` is the anonymous user.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<i32, HttpError>;
}

/// Trusts the gateway's user id header; missing header means
/// anonymous.
#[derive(Debug, Clone, Default)]
pub struct HeaderAuth;

#[async_trait]
impl Authenticator for HeaderAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<i32, HttpError> {
        let Some(raw) = headers.get(USER_ID_HEADER) else {
            return Ok(0);
        };
        let user_id: i32 = raw
            .to_str()
            .ok()
            .and_then(|value| value.parse().ok())
            .ok_or_else(|| HttpError::Unauthorized("malformed user id header".to_string()))?;
        if user_id < 0 {
            return Err(HttpError::Unauthorized("negative user id".to_string()));
        }
        Ok(user_id)
    }
}

/// Serves every request as one fixed user (development setups).
#[derive(Debug, Clone)]
pub struct SingleUser(pub i32);

#[async_trait]
impl Authenticator for SingleUser {
    async fn authenticate(&self, _headers: &HeaderMap) -> Result<i32, HttpError> {
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_header_is_anonymous() {
        let headers = HeaderMap::new();
        assert_eq!(HeaderAuth.authenticate(&headers).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_header_value_is_parsed() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "42".parse().unwrap());
        assert_eq!(HeaderAuth.authenticate(&headers).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_malformed_header_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "abc".parse().unwrap());
        assert!(HeaderAuth.authenticate(&headers).await.is_err());
    }

    #[tokio::test]
    async fn test_single_user() {
        let headers = HeaderMap::new();
        assert_eq!(SingleUser(7).authenticate(&headers).await.unwrap(), 7);
    }
}

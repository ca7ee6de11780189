//! JWT-backed identity verification
//!
//! Verifies HS256 tokens minted by the identity service against a shared
//! secret. Token issuance lives here too so development setups and tests can
//! run without the external service.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::{Identity, UserId};
use crate::service::auth::IdentityVerifier;
use crate::{Error, Result};

/// Claims carried by an identity token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: String,
    /// Display name
    pub name: Option<String>,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: UserId::from_string(self.sub.clone()),
            display_name: self
                .name
                .clone()
                .unwrap_or_else(|| self.sub.clone()),
        }
    }
}

/// HS256 verifier (and development-mode issuer) for identity tokens.
#[derive(Clone)]
pub struct JwtIdentityService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl std::fmt::Debug for JwtIdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityService").finish()
    }
}

impl JwtIdentityService {
    #[must_use]
    pub fn new(secret: &[u8], leeway_seconds: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_seconds;

        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation,
        }
    }

    /// Issue a token for a user. Stands in for the external identity
    /// service in development and tests.
    pub fn issue_token(
        &self,
        user_id: &UserId,
        display_name: &str,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.as_str().to_string(),
            name: Some(display_name.to_string()),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }
}

#[async_trait]
impl IdentityVerifier for JwtIdentityService {
    async fn verify_token(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| Error::Authentication(format!("Invalid token: {e}")))?;

        Ok(data.claims.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtIdentityService {
        JwtIdentityService::new(b"test-secret", 0)
    }

    #[tokio::test]
    async fn test_issue_and_verify_roundtrip() {
        let service = service();
        let user_id = UserId::from("user12345678");

        let token = service
            .issue_token(&user_id, "Ada", Duration::hours(1))
            .unwrap();
        let identity = service.verify_token(&token).await.unwrap();

        assert_eq!(identity.user_id, user_id);
        assert_eq!(identity.display_name, "Ada");
    }

    #[tokio::test]
    async fn test_display_name_falls_back_to_user_id() {
        let claims = Claims {
            sub: "user12345678".to_string(),
            name: None,
            iat: 0,
            exp: 0,
        };
        assert_eq!(claims.identity().display_name, "user12345678");
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let service = service();
        let token = service
            .issue_token(&UserId::from("user12345678"), "Ada", Duration::hours(-2))
            .unwrap();

        let err = service.verify_token(&token).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_garbage_token_is_rejected() {
        let err = service().verify_token("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let token = service()
            .issue_token(&UserId::from("user12345678"), "Ada", Duration::hours(1))
            .unwrap();

        let other = JwtIdentityService::new(b"different-secret", 0);
        assert!(other.verify_token(&token).await.is_err());
    }
}

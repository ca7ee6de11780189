//! Identity verification and stage access policy

pub mod jwt;

use async_trait::async_trait;
use subtle::ConstantTimeEq;

use crate::models::Identity;
use crate::Result;

pub use jwt::JwtIdentityService;

/// Resolves opaque bearer tokens into user identities.
///
/// The real identity service lives outside this process; this trait is the
/// seam it is called through.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify a bearer token. `Error::Authentication` on a bad or expired
    /// token.
    async fn verify_token(&self, token: &str) -> Result<Identity>;
}

/// The single place a supplied stage secret is compared against the stored
/// one. The stored secret is currently plaintext; swapping in a hashed
/// scheme only touches this function.
#[must_use]
pub fn secret_matches(supplied: &str, stored: &str) -> bool {
    supplied.as_bytes().ct_eq(stored.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_matches() {
        assert!(secret_matches("letmein", "letmein"));
        assert!(!secret_matches("letmein", "letmeout"));
        assert!(!secret_matches("letmein", "letmein "));
        assert!(secret_matches("", ""));
    }
}

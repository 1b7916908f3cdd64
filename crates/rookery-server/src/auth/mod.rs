//! Capability token verification for the session gateway
//!
//! Tokens are issued externally (by the auth service) and verified here
//! with a shared HMAC key. A token is
//! `base64url(user_id:username:expires_epoch) . base64url(hmac_sha256)`.
//! This module never issues tokens for production use; `mint` exists for
//! tests and local tooling.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token signature mismatch")]
    BadSignature,

    #[error("Token expired")]
    Expired,
}

/// Verified identity carried by a capability token
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub user_id: i64,
    pub username: String,
    /// Epoch seconds
    pub expires_at: i64,
}

/// Verifies externally issued capability tokens
#[derive(Clone)]
pub struct TokenVerifier {
    key: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// Verify a token and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let (payload_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| AuthError::Malformed("missing signature separator".to_string()))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| AuthError::Malformed(format!("payload: {}", e)))?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| AuthError::Malformed(format!("signature: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AuthError::Malformed(format!("key: {}", e)))?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = String::from_utf8(payload)
            .map_err(|e| AuthError::Malformed(format!("payload utf8: {}", e)))?;
        let mut parts = payload.splitn(3, ':');
        let user_id: i64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| AuthError::Malformed("user id".to_string()))?;
        let username = parts
            .next()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AuthError::Malformed("username".to_string()))?
            .to_string();
        let expires_at: i64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| AuthError::Malformed("expiry".to_string()))?;

        if Utc::now().timestamp() >= expires_at {
            return Err(AuthError::Expired);
        }

        Ok(Claims {
            user_id,
            username,
            expires_at,
        })
    }

    /// Mint a token (tests and local tooling only; issuance is external)
    pub fn mint(&self, user_id: i64, username: &str, ttl_secs: i64) -> String {
        let expires_at = Utc::now().timestamp() + ttl_secs;
        let payload = format!("{}:{}:{}", user_id, username, expires_at);

        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        let signature = mac.finalize().into_bytes();

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload.as_bytes()),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let verifier = TokenVerifier::new(b"test-key");
        let token = verifier.mint(42, "alice", 3600);

        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn test_wrong_key_rejected() {
        let issuer = TokenVerifier::new(b"key-a");
        let verifier = TokenVerifier::new(b"key-b");
        let token = issuer.mint(42, "alice", 3600);

        assert!(matches!(
            verifier.verify(&token),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = TokenVerifier::new(b"test-key");
        let token = verifier.mint(42, "alice", -1);

        assert!(matches!(verifier.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let verifier = TokenVerifier::new(b"test-key");
        let token = verifier.mint(42, "alice", 3600);
        let sig = token.split_once('.').unwrap().1;
        let forged = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(format!("1:admin:{}", Utc::now().timestamp() + 3600)),
            sig
        );

        assert!(matches!(
            verifier.verify(&forged),
            Err(AuthError::BadSignature)
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let verifier = TokenVerifier::new(b"test-key");
        assert!(matches!(
            verifier.verify("not-a-token"),
            Err(AuthError::Malformed(_))
        ));
        assert!(matches!(
            verifier.verify("a.b"),
            Err(AuthError::Malformed(_))
        ));
    }
}

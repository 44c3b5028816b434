//! Bearer-token authentication.
//!
//! Tokens are `<owner_id>.<hex(hmac_sha256(owner_id, secret))>`. The
//! identity provider that hands tokens to users is out of scope; this
//! layer only resolves an `Authorization` header to an owner id, which
//! every thread/evidence access is scoped by.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Token signer/verifier built from the configured secret.
#[derive(Clone)]
pub struct AuthKeys {
    secret: Vec<u8>,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Issue a token for an owner id.
    pub fn issue(&self, owner_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(owner_id.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("{owner_id}.{sig}")
    }

    /// Verify a token and return the owner id it names.
    ///
    /// Verification is constant-time in the signature comparison.
    pub fn verify(&self, token: &str) -> Option<String> {
        let (owner_id, sig_hex) = token.rsplit_once('.')?;
        if owner_id.is_empty() {
            return None;
        }
        let sig = hex::decode(sig_hex).ok()?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(owner_id.as_bytes());
        mac.verify_slice(&sig).ok()?;
        Some(owner_id.to_string())
    }
}

/// Resolve the caller's owner id from request headers.
///
/// # Errors
///
/// Returns `AUTH_UNAUTHORIZED` when the header is missing, malformed, or
/// carries an invalid signature. Never retried.
pub fn caller_identity(headers: &HeaderMap, keys: &AuthKeys) -> Result<String> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let token = value.strip_prefix("Bearer ").ok_or(AppError::Unauthorized)?;

    keys.verify(token).ok_or(AppError::Unauthorized)
}

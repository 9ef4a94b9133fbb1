//! HMAC-signed token verification.
//!
//! Tokens are compact JWTs (`header.payload.signature`, base64url without
//! padding) signed with HMAC-SHA256 and a shared secret. This is the single
//! verification path used both at upgrade time and by the `secure` pipeline
//! modifier.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors produced while verifying a token.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The token is not three base64url segments of valid JSON.
    #[error("token is malformed")]
    Malformed,

    /// The token header names an algorithm other than HMAC-SHA256.
    #[error("unexpected signing algorithm '{0}'")]
    Algorithm(String),

    /// The signature does not match the payload.
    #[error("token signature mismatch")]
    Signature,

    /// The `exp` claim is in the past.
    #[error("token has expired")]
    Expired,

    /// The `sub` claim is missing or empty.
    #[error("token missing non-empty 'sub' claim")]
    MissingSubject,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// The claims carried by a verified token.
///
/// `sub` is the user id and must be non-empty. `perms` optionally names
/// global permissions to be compiled against the permission registry. Any
/// further claims are kept verbatim and reachable through [`TokenClaims::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub perms: Vec<String>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TokenClaims {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            perms: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Returns a claim as a string, or `None` if absent.
    ///
    /// Non-string JSON values are rendered with their JSON representation.
    pub fn get(&self, key: &str) -> Option<String> {
        if key == "sub" {
            return Some(self.sub.clone());
        }
        self.extra.get(key).map(|value| match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Verifies `token` against `secret` and returns its claims.
pub fn verify(token: &str, secret: &[u8]) -> Result<TokenClaims, AuthError> {
    let mut segments = token.split('.');
    let (header_b64, payload_b64, signature_b64) =
        match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(h), Some(p), Some(s), None) => (h, p, s),
            _ => return Err(AuthError::Malformed),
        };

    let header_bytes = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|_| AuthError::Malformed)?;
    let header: Header =
        serde_json::from_slice(&header_bytes).map_err(|_| AuthError::Malformed)?;
    if header.alg != "HS256" {
        return Err(AuthError::Algorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::Malformed)?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| AuthError::Signature)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::Signature)?;

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::Malformed)?;
    let claims: TokenClaims =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::Malformed)?;

    if let Some(exp) = claims.extra.get("exp").and_then(|v| v.as_i64()) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        if exp < now {
            return Err(AuthError::Expired);
        }
    }

    if claims.sub.is_empty() {
        return Err(AuthError::MissingSubject);
    }

    Ok(claims)
}

/// Signs `claims` into a compact token. Used by operators issuing tokens and
/// by the test suite.
pub fn sign(claims: &TokenClaims, secret: &[u8]) -> String {
    let header = Header {
        alg: "HS256".to_string(),
        typ: Some("JWT".to_string()),
    };
    let header_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).expect("header serializes"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));

    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    let signature_b64 = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    format!("{header_b64}.{payload_b64}.{signature_b64}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn test_sign_verify_round_trip() {
        let mut claims = TokenClaims::new("alice");
        claims.perms = vec!["read".to_string()];
        claims
            .extra
            .insert("tier".to_string(), serde_json::json!("gold"));

        let token = sign(&claims, SECRET);
        let verified = verify(&token, SECRET).unwrap();
        assert_eq!(verified.sub, "alice");
        assert_eq!(verified.perms, vec!["read".to_string()]);
        assert_eq!(verified.get("tier").as_deref(), Some("gold"));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let token = sign(&TokenClaims::new("alice"), SECRET);
        assert_eq!(verify(&token, b"other-secret"), Err(AuthError::Signature));
    }

    #[test]
    fn test_tampered_payload_is_rejected() {
        let token = sign(&TokenClaims::new("alice"), SECRET);
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory"}"#);
        parts[1] = forged.as_str();
        let forged_token = parts.join(".");
        assert_eq!(verify(&forged_token, SECRET), Err(AuthError::Signature));
    }

    #[test]
    fn test_empty_subject_is_rejected() {
        let token = sign(&TokenClaims::new(""), SECRET);
        assert_eq!(verify(&token, SECRET), Err(AuthError::MissingSubject));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mut claims = TokenClaims::new("alice");
        claims.extra.insert("exp".to_string(), serde_json::json!(1));
        let token = sign(&claims, SECRET);
        assert_eq!(verify(&token, SECRET), Err(AuthError::Expired));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(verify("not-a-token", SECRET), Err(AuthError::Malformed));
        assert_eq!(verify("a.b.c", SECRET), Err(AuthError::Malformed));
    }

    #[test]
    fn test_non_string_claim_renders_as_json() {
        let mut claims = TokenClaims::new("alice");
        claims
            .extra
            .insert("level".to_string(), serde_json::json!(42));
        let token = sign(&claims, SECRET);
        let verified = verify(&token, SECRET).unwrap();
        assert_eq!(verified.get("level").as_deref(), Some("42"));
        assert_eq!(verified.get("absent"), None);
    }
}

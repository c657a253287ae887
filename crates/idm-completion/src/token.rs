//! Short-lived bearer tokens for the completion API.
//!
//! The API key is `<id>.<secret>`. Each request carries a freshly signed
//! HS256 token whose header has the vendor's extra `sign_type` field, which
//! is why it is assembled by hand instead of through `jsonwebtoken`.

use std::str::FromStr;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::error::CompletionError;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct ApiKey {
    id: String,
    secret: String,
}

impl ApiKey {
    pub fn id(&self) -> &str {
        &self.id
    }
}

// Keep the secret out of logs.
impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey").field("id", &self.id).finish_non_exhaustive()
    }
}

impl FromStr for ApiKey {
    type Err = CompletionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, secret) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| CompletionError::InvalidKey("expected <id>.<secret>".into()))?;

        if id.is_empty() || secret.is_empty() || secret.contains('.') {
            return Err(CompletionError::InvalidKey("expected <id>.<secret>".into()));
        }

        Ok(Self {
            id: id.to_string(),
            secret: secret.to_string(),
        })
    }
}

#[derive(Serialize)]
struct TokenHeader {
    alg: &'static str,
    sign_type: &'static str,
}

#[derive(Serialize)]
struct TokenPayload<'a> {
    api_key: &'a str,
    exp: i64,
    timestamp: i64,
}

/// Sign a token valid from `now_ms` for `ttl`.
pub fn sign(key: &ApiKey, now_ms: i64, ttl: Duration) -> Result<String, CompletionError> {
    let header = serde_json::to_vec(&TokenHeader {
        alg: "HS256",
        sign_type: "SIGN",
    })
    .map_err(|e| CompletionError::Internal(e.to_string()))?;

    let payload = serde_json::to_vec(&TokenPayload {
        api_key: &key.id,
        exp: now_ms + ttl.as_millis() as i64,
        timestamp: now_ms,
    })
    .map_err(|e| CompletionError::Internal(e.to_string()))?;

    let signing_input = format!("{}.{}", B64.encode(header), B64.encode(payload));

    let mut mac = HmacSha256::new_from_slice(key.secret.as_bytes())
        .map_err(|e| CompletionError::Internal(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    let signature = B64.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

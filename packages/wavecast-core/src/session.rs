//! Signed session tokens.
//!
//! Token format: `base64url(payload_json) "." base64url(hmac_sha256(secret, payload_b64))`
//! where the MAC is computed over the *encoded* payload half. Validation uses
//! a constant-time MAC comparison and enforces a 24-hour lifetime.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::protocol_constants::SESSION_TTL_SECS;

type HmacSha256 = Hmac<Sha256>;

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "wavecast_session";

/// Decoded session payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub username: String,
    /// Unix milliseconds at issuance.
    pub issued_at: u64,
}

/// Issues and validates session tokens.
///
/// With no secret configured every `create` returns `None` and every
/// `validate` fails; the HTTP layer surfaces that as 503 on login.
pub struct SessionService {
    secret: Option<Vec<u8>>,
}

impl SessionService {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(|s| s.as_bytes().to_vec()),
        }
    }

    /// True when a signing secret is configured.
    #[must_use]
    pub fn configured(&self) -> bool {
        self.secret.is_some()
    }

    /// Creates a signed token for `username`, or `None` without a secret.
    pub fn create(&self, username: &str) -> Option<String> {
        let secret = self.secret.as_deref()?;
        let session = Session {
            username: username.to_string(),
            issued_at: now_millis(),
        };
        let payload = serde_json::to_vec(&session).ok()?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let sig = sign(secret, payload_b64.as_bytes());
        Some(format!("{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig)))
    }

    /// Validates a presented token. Any failure (malformed shape, bad
    /// base64, MAC mismatch, expiry) returns `None`.
    pub fn validate(&self, token: &str) -> Option<Session> {
        let secret = self.secret.as_deref()?;
        let (payload_b64, sig_b64) = token.split_once('.')?;
        let presented = URL_SAFE_NO_PAD.decode(sig_b64).ok()?;

        let mut mac = HmacSha256::new_from_slice(secret).ok()?;
        mac.update(payload_b64.as_bytes());
        // Constant-time comparison; a forged signature fails here.
        mac.verify_slice(&presented).ok()?;

        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let session: Session = serde_json::from_slice(&payload).ok()?;

        let age_ms = now_millis().saturating_sub(session.issued_at);
        if age_ms > SESSION_TTL_SECS * 1000 {
            return None;
        }
        Some(session)
    }

    /// Pulls the session cookie out of a `Cookie` header value and validates it.
    pub fn validate_cookie_header(&self, cookie_header: &str) -> Option<Session> {
        let token = cookie_header.split(';').find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name == SESSION_COOKIE).then_some(value)
        })?;
        self.validate(token)
    }
}

fn sign(secret: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Constant-time byte comparison for low-entropy secrets (login password).
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

//! Shared-secret login tokens.
//!
//! The token is the lowercase hex SHA-256 of `secret || decimal(timestamp)`.
//! The server recomputes it from the timestamp carried in the [`Login`]
//! message. The timestamp is not checked for freshness, so a captured Login
//! can be replayed.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::messages::Login;
use crate::PROTOCOL_VERSION;

/// Derive the credential for `secret` at `timestamp`
pub fn credential(secret: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(timestamp.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Build a Login message for `secret` at `now` (unix seconds)
pub fn issue(secret: &str, now: i64) -> Login {
    Login {
        token: credential(secret, now),
        version: PROTOCOL_VERSION.to_string(),
        timestamp: now,
    }
}

/// Build a Login message stamped with the current wall-clock time
pub fn issue_now(secret: &str) -> Login {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    issue(secret, now)
}

pub fn verify(secret: &str, token: &str, timestamp: i64) -> bool {
    credential(secret, timestamp) == token
}

/// Server-side check applied to the first frame of every physical connection
pub trait Authenticator: Send + Sync {
    fn verify_login(&self, login: &Login) -> bool;
}

/// Accepts logins whose token matches the shared secret
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    secret: String,
}

impl TokenAuthenticator {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn verify_login(&self, login: &Login) -> bool {
        verify(&self.secret, &login.token, login.timestamp)
    }
}

/// Accepts every login (no secret configured)
#[derive(Debug, Clone, Copy, Default)]
pub struct NopAuthenticator;

impl Authenticator for NopAuthenticator {
    fn verify_login(&self, _login: &Login) -> bool {
        true
    }
}

/// Pick the authenticator for a configured secret (empty = none)
pub fn from_secret(secret: &str) -> Box<dyn Authenticator> {
    if secret.is_empty() {
        Box::new(NopAuthenticator)
    } else {
        Box::new(TokenAuthenticator::new(secret))
    }
}

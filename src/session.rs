//! Credentials and bearer-token lifecycle.
//!
//! The vendor does not document token expiry, so a token is simply
//! considered stale once it is older than the configured freshness window.

use std::time::{Duration, Instant};

pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(300);

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl core::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
struct Token {
    value: String,
    acquired_at: Instant,
}

#[derive(Debug)]
pub struct Session {
    credentials: Credentials,
    token: Option<Token>,
    freshness: Duration,
}

impl core::fmt::Debug for Token {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

impl Session {
    pub fn new(credentials: Credentials, freshness: Duration) -> Self {
        Session {
            credentials,
            token: None,
            freshness,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// The held token, if one exists and is younger than the freshness window.
    pub fn fresh_token(&self, now: Instant) -> Option<&str> {
        self.token
            .as_ref()
            .filter(|t| now.saturating_duration_since(t.acquired_at) < self.freshness)
            .map(|t| t.value.as_str())
    }

    pub fn store(&mut self, value: String, now: Instant) {
        self.token = Some(Token {
            value,
            acquired_at: now,
        });
    }

    /// Drops the held token only when it is the one the caller saw rejected.
    /// Returns whether anything was dropped.
    pub fn invalidate_if(&mut self, rejected: &str) -> bool {
        if self.token.as_ref().is_some_and(|t| t.value == rejected) {
            self.token = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(freshness: Duration) -> Session {
        Session::new(Credentials::new("grower@example.com", "hunter2"), freshness)
    }

    #[test]
    fn no_token_is_never_fresh() {
        let s = session(DEFAULT_FRESHNESS);
        assert_eq!(s.fresh_token(Instant::now()), None);
    }

    #[test]
    fn token_goes_stale_after_window() {
        let mut s = session(Duration::from_secs(300));
        let t0 = Instant::now();
        s.store("abc".into(), t0);
        assert_eq!(s.fresh_token(t0), Some("abc"));
        assert_eq!(s.fresh_token(t0 + Duration::from_secs(299)), Some("abc"));
        assert_eq!(s.fresh_token(t0 + Duration::from_secs(300)), None);
        // stale but still held
        assert!(s.invalidate_if("abc"));
    }

    #[test]
    fn invalidate_only_drops_matching_token() {
        let mut s = session(DEFAULT_FRESHNESS);
        let now = Instant::now();
        s.store("new".into(), now);
        assert!(!s.invalidate_if("old"));
        assert_eq!(s.fresh_token(now), Some("new"));
        assert!(s.invalidate_if("new"));
        assert_eq!(s.fresh_token(now), None);
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut s = session(DEFAULT_FRESHNESS);
        s.store("secret-token".into(), Instant::now());
        let printed = format!("{:?}", s);
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("grower@example.com"));
    }
}

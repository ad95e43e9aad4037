//! Acknowledgement-based echo guard.
//!
//! A guard is held while one of our own writes is in flight. It is identified
//! by a token, and only the acknowledgement carrying that token releases it.
//! A maximum hold time acts as a safety net when no acknowledgement arrives.

use std::fmt::{self, Display, Formatter};
use tracing::warn;

/// Identifies one in-flight write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardToken(String);

impl GuardToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for GuardToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GuardToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug)]
struct Held {
    token: GuardToken,
    expires_at: u64,
}

/// Guard released by a matching acknowledgement or by timeout.
#[derive(Debug)]
pub struct AckGuard {
    max_hold_ms: u64,
    held: Option<Held>,
}

impl AckGuard {
    pub fn new(max_hold_ms: u64) -> Self {
        Self {
            max_hold_ms,
            held: None,
        }
    }

    /// Take the guard for a new write and return its token.
    pub fn begin(&mut self, now: u64) -> GuardToken {
        if let Some(previous) = &self.held {
            warn!("Guard {} replaced before acknowledgement", previous.token);
        }
        let token = GuardToken::generate();
        self.held = Some(Held {
            token: token.clone(),
            expires_at: now.saturating_add(self.max_hold_ms),
        });
        token
    }

    /// Release the guard if `token` matches the write in flight.
    ///
    /// Returns false for stale or unknown tokens, which leave the guard untouched.
    pub fn acknowledge(&mut self, token: &str) -> bool {
        match &self.held {
            Some(held) if held.token.as_str() == token => {
                self.held = None;
                true
            }
            _ => false,
        }
    }

    /// Whether a write is still in flight at `now`. Expired guards are dropped.
    pub fn is_held(&mut self, now: u64) -> bool {
        match &self.held {
            Some(held) if now >= held.expires_at => {
                warn!(
                    "Guard {} expired after {}ms without acknowledgement",
                    held.token, self.max_hold_ms
                );
                self.held = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn release(&mut self) {
        self.held = None;
    }

    pub fn token(&self) -> Option<&GuardToken> {
        self.held.as_ref().map(|h| &h.token)
    }

    pub fn expires_at(&self) -> Option<u64> {
        self.held.as_ref().map(|h| h.expires_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_matching_token_releases() {
        let mut guard = AckGuard::new(5_000);
        let token = guard.begin(1_000);

        assert!(!guard.acknowledge("someone-else"));
        assert!(guard.is_held(1_100));

        assert!(guard.acknowledge(token.as_str()));
        assert!(!guard.is_held(1_100));
    }

    #[test]
    fn test_stale_token_after_replacement_is_ignored() {
        let mut guard = AckGuard::new(5_000);
        let first = guard.begin(0);
        let second = guard.begin(10);

        assert!(!guard.acknowledge(first.as_str()));
        assert!(guard.is_held(20));
        assert!(guard.acknowledge(second.as_str()));
    }

    #[test]
    fn test_guard_expires_at_safety_timeout() {
        let mut guard = AckGuard::new(5_000);
        guard.begin(1_000);

        assert!(guard.is_held(5_999));
        assert!(!guard.is_held(6_000));
        assert!(guard.token().is_none());
    }
}

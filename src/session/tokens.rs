//! Single source of truth for the current bearer token.

use secrecy::SecretString;
use std::time::Instant;
use tokio::sync::RwLock;

/// The live credential set for one authenticated session.
///
/// The refresh credential travels out-of-band (an `HttpOnly` cookie) and is
/// never modeled here. The expiry is best-effort; servers may omit it.
#[derive(Clone, Debug)]
pub struct AccessSession {
    access_token: SecretString,
    expires_at: Option<Instant>,
}

impl AccessSession {
    #[must_use]
    pub fn new(access_token: SecretString, expires_at: Option<Instant>) -> Self {
        Self {
            access_token,
            expires_at,
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &SecretString {
        &self.access_token
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }
}

/// Holds the authoritative token; replaced wholesale, never merged.
///
/// Requests read the cache at send time, not at enqueue time, which is what
/// lets a request queued during a refresh pick up the freshly issued token
/// when replayed.
#[derive(Default)]
pub struct SessionTokenCache {
    current: RwLock<Option<AccessSession>>,
}

impl SessionTokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<AccessSession> {
        self.current.read().await.clone()
    }

    pub async fn replace(&self, session: AccessSession) {
        *self.current.write().await = Some(session);
    }

    pub async fn clear(&self) {
        *self.current.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::{AccessSession, SessionTokenCache};
    use secrecy::{ExposeSecret, SecretString};
    use std::time::{Duration, Instant};

    fn session(token: &str) -> AccessSession {
        AccessSession::new(SecretString::from(token.to_string()), None)
    }

    #[tokio::test]
    async fn starts_empty() {
        let cache = SessionTokenCache::new();
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn replace_swaps_the_whole_session() {
        let cache = SessionTokenCache::new();
        cache.replace(session("token-1")).await;
        cache.replace(session("token-2")).await;

        let current = cache.get().await.map(|s| s.access_token().expose_secret().to_string());
        assert_eq!(current.as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn clear_removes_the_session() {
        let cache = SessionTokenCache::new();
        cache.replace(session("token-1")).await;
        cache.clear().await;
        assert!(cache.get().await.is_none());
    }

    #[tokio::test]
    async fn expiry_is_optional_metadata() {
        let expires_at = Instant::now() + Duration::from_secs(60);
        let session = AccessSession::new(SecretString::from("token-1".to_string()), Some(expires_at));
        assert_eq!(session.expires_at(), Some(expires_at));
        assert!(AccessSession::new(SecretString::from("token-2".to_string()), None)
            .expires_at()
            .is_none());
    }
}

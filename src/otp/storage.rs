//! TTL-bounded storage for outstanding OTP challenges.
//!
//! The store is a minimal TTL map so an in-process map and a distributed
//! cache stay interchangeable without touching challenge logic. Entries
//! expire lazily at read time; `put` opportunistically sweeps expired
//! entries to bound memory.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::challenge::{ChallengeKey, OtpChallenge};

/// Keyed TTL storage for challenges.
///
/// Absence is reported as `Ok(None)`; `Err` means the store itself failed.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn put(&self, key: ChallengeKey, challenge: OtpChallenge) -> Result<()>;
    async fn fetch(&self, key: &ChallengeKey) -> Result<Option<OtpChallenge>>;
    async fn remove(&self, key: &ChallengeKey) -> Result<()>;
}

/// In-process challenge store backed by a keyed map.
#[derive(Default)]
pub struct MemoryChallengeStore {
    entries: Mutex<HashMap<ChallengeKey, OtpChallenge>>,
}

impl MemoryChallengeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn put(&self, key: ChallengeKey, challenge: OtpChallenge) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| !entry.is_expired());
        entries.insert(key, challenge);
        Ok(())
    }

    async fn fetch(&self, key: &ChallengeKey) -> Result<Option<OtpChallenge>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &ChallengeKey) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

//! Server-side one-time-passcode (OTP) second factor.
//!
//! Flow Overview:
//! 1) `generate` mints a 6-digit secret, stores a TTL-bounded challenge
//!    under `(subject, purpose)` and hands the secret back for out-of-band
//!    delivery (email/SMS).
//! 2) `validate` runs inside a per-key critical section: a correct code
//!    consumes the challenge, a wrong one increments its failure counter,
//!    and the third wrong guess destroys the challenge outright.
//! 3) Expiry is lazy. Wrong, expired and locked-out codes are
//!    indistinguishable to callers, so verification leaks no challenge
//!    state.

pub mod challenge;
pub mod storage;

pub use challenge::{ChallengeKey, OtpChallenge};
pub use storage::{ChallengeStore, MemoryChallengeStore};

use anyhow::Result;
use rand::{rngs::OsRng, Rng};
use secrecy::SecretString;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_MAX_FAILED_ATTEMPTS: u8 = 3;
const SECRET_RANGE: RangeInclusive<u32> = 100_000..=999_999;

/// Challenge issuance and lockout policy.
#[derive(Clone, Debug)]
pub struct OtpConfig {
    ttl: Duration,
    max_failed_attempts: u8,
}

impl OtpConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_CHALLENGE_TTL,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_failed_attempts(mut self, max_failed_attempts: u8) -> Self {
        self.max_failed_attempts = max_failed_attempts;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn max_failed_attempts(&self) -> u8 {
        self.max_failed_attempts
    }
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues and checks short-lived numeric second-factor codes with a bounded
/// brute-force tolerance.
///
/// Validation and issuance for one key are linearizable: the
/// read-increment-write of the failure counter happens under a per-key
/// lock, so concurrent wrong guesses cannot under-count. Independent keys
/// never contend on each other's critical section.
pub struct OtpChallengeEngine {
    config: OtpConfig,
    store: Arc<dyn ChallengeStore>,
    key_locks: Mutex<HashMap<ChallengeKey, Arc<Mutex<()>>>>,
}

impl OtpChallengeEngine {
    #[must_use]
    pub fn new(config: OtpConfig, store: Arc<dyn ChallengeStore>) -> Self {
        Self {
            config,
            store,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh challenge for `(subject, purpose)`, overwriting any
    /// prior one and resetting its failure counter.
    ///
    /// The secret is returned for out-of-band delivery and is never logged
    /// or transmitted by the engine. Issuance is not throttled; see
    /// [`Self::can_generate`].
    ///
    /// # Errors
    /// Returns an error if the challenge store fails.
    #[instrument(skip(self))]
    pub async fn generate(&self, subject: &str, purpose: &str) -> Result<String> {
        let key = ChallengeKey::new(subject, purpose);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let secret = mint_secret();
        let challenge = OtpChallenge::new(SecretString::from(secret.clone()), self.config.ttl());
        self.store.put(key, challenge).await?;
        debug!("Issued OTP challenge");
        Ok(secret)
    }

    /// Check a submitted code against the outstanding challenge.
    ///
    /// Wrong code, lockout and expiry all surface as `Ok(false)`; callers
    /// must treat them identically and either retry or request a new
    /// challenge. `Err` is reserved for store failures.
    ///
    /// # Errors
    /// Returns an error if the challenge store fails.
    #[instrument(skip(self, submitted))]
    pub async fn validate(&self, subject: &str, purpose: &str, submitted: &str) -> Result<bool> {
        let key = ChallengeKey::new(subject, purpose);
        let lock = self.key_lock(&key).await;
        let guard = lock.lock().await;

        let Some(mut challenge) = self.store.fetch(&key).await? else {
            drop(guard);
            drop(lock);
            self.sweep_key_lock(&key).await;
            return Ok(false);
        };

        if challenge.matches(submitted) {
            self.store.remove(&key).await?;
            debug!("OTP challenge satisfied");
            drop(guard);
            drop(lock);
            self.sweep_key_lock(&key).await;
            return Ok(true);
        }

        let failures = challenge.register_failure();
        if failures >= self.config.max_failed_attempts() {
            // The challenge is gone for good; even the correct code fails
            // until a new one is generated.
            self.store.remove(&key).await?;
            warn!(failures, "OTP challenge locked out");
            drop(guard);
            drop(lock);
            self.sweep_key_lock(&key).await;
        } else {
            self.store.put(key, challenge).await?;
        }
        Ok(false)
    }

    /// Issuance throttling hook. Always allows issuance today: repeated
    /// calls replace the outstanding challenge with no cooldown, which is a
    /// known hardening gap for resend abuse.
    #[must_use]
    pub fn can_generate(&self, _subject: &str) -> bool {
        true
    }

    async fn key_lock(&self, key: &ChallengeKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock registry entry for a purged key once nobody holds it.
    async fn sweep_key_lock(&self, key: &ChallengeKey) {
        let mut locks = self.key_locks.lock().await;
        let idle = locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(key);
        }
    }
}

fn mint_secret() -> String {
    // Uniform over the full 6-digit range; never padded, never biased.
    OsRng.gen_range(SECRET_RANGE).to_string()
}

#[cfg(test)]
mod tests {
    use super::{
        mint_secret, MemoryChallengeStore, OtpChallengeEngine, OtpConfig, SECRET_RANGE,
    };
    use anyhow::Result;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> OtpChallengeEngine {
        OtpChallengeEngine::new(OtpConfig::new(), Arc::new(MemoryChallengeStore::new()))
    }

    #[test]
    fn minted_secrets_are_six_decimal_digits() {
        for _ in 0..10_000 {
            let secret = mint_secret();
            assert_eq!(secret.len(), 6);
            let value: u32 = secret.parse().expect("secret is numeric");
            assert!(SECRET_RANGE.contains(&value));
        }
    }

    #[test]
    fn config_defaults_and_overrides() {
        let config = OtpConfig::new();
        assert_eq!(config.ttl(), Duration::from_secs(300));
        assert_eq!(config.max_failed_attempts(), 3);

        let config = config
            .with_ttl(Duration::from_secs(60))
            .with_max_failed_attempts(5);
        assert_eq!(config.ttl(), Duration::from_secs(60));
        assert_eq!(config.max_failed_attempts(), 5);
    }

    #[tokio::test]
    async fn correct_code_consumes_the_challenge() -> Result<()> {
        let engine = engine();
        let secret = engine.generate("u1", "login").await?;

        assert!(engine.validate("u1", "login", &secret).await?);
        // One-time: the same code no longer verifies.
        assert!(!engine.validate("u1", "login", &secret).await?);
        Ok(())
    }

    #[tokio::test]
    async fn validate_without_generate_is_false() -> Result<()> {
        let engine = engine();
        assert!(!engine.validate("u1", "login", "123456").await?);
        Ok(())
    }

    #[tokio::test]
    async fn three_wrong_guesses_purge_the_challenge() -> Result<()> {
        let engine = engine();
        let secret = engine.generate("u1", "login").await?;

        for _ in 0..3 {
            assert!(!engine.validate("u1", "login", "000000").await?);
        }
        // Even the originally correct code fails after lockout.
        assert!(!engine.validate("u1", "login", &secret).await?);
        Ok(())
    }

    #[tokio::test]
    async fn regenerate_resets_the_failure_counter() -> Result<()> {
        let engine = engine();
        let _first = engine.generate("u1", "login").await?;
        assert!(!engine.validate("u1", "login", "000000").await?);
        assert!(!engine.validate("u1", "login", "000000").await?);

        let second = engine.generate("u1", "login").await?;
        assert!(!engine.validate("u1", "login", "000000").await?);
        assert!(!engine.validate("u1", "login", "000000").await?);
        // Four wrong guesses total, but only two against this challenge.
        assert!(engine.validate("u1", "login", &second).await?);
        Ok(())
    }

    #[tokio::test]
    async fn correct_code_after_ttl_is_false() -> Result<()> {
        let config = OtpConfig::new().with_ttl(Duration::from_millis(20));
        let engine = OtpChallengeEngine::new(config, Arc::new(MemoryChallengeStore::new()));
        let secret = engine.generate("u1", "login").await?;

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!engine.validate("u1", "login", &secret).await?);
        Ok(())
    }

    #[tokio::test]
    async fn keys_are_independent() -> Result<()> {
        let engine = engine();
        let login_secret = engine.generate("u1", "login").await?;
        let reset_secret = engine.generate("u1", "reset").await?;

        for _ in 0..3 {
            assert!(!engine.validate("u1", "login", "000000").await?);
        }
        // Lockout on one purpose leaves the other challenge untouched.
        assert!(!engine.validate("u1", "login", &login_secret).await?);
        assert!(engine.validate("u1", "reset", &reset_secret).await?);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_wrong_guesses_respect_the_attempt_ceiling() -> Result<()> {
        let engine = Arc::new(engine());
        let secret = engine.generate("u1", "login").await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let engine = Arc::clone(&engine);
            handles.push(tokio::spawn(async move {
                engine.validate("u1", "login", "000000").await
            }));
        }
        for handle in handles {
            assert!(!handle.await??);
        }
        // The third wrong guess purged the challenge, no matter how the
        // eight guesses interleaved.
        assert!(!engine.validate("u1", "login", &secret).await?);
        Ok(())
    }

    #[tokio::test]
    async fn lock_registry_is_swept_after_purge() -> Result<()> {
        let engine = engine();
        let secret = engine.generate("u1", "login").await?;
        assert!(engine.validate("u1", "login", &secret).await?);
        assert!(engine.key_locks.lock().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn can_generate_is_unthrottled() -> Result<()> {
        let engine = engine();
        assert!(engine.can_generate("u1"));
        let _ = engine.generate("u1", "login").await?;
        assert!(engine.can_generate("u1"));
        Ok(())
    }
}

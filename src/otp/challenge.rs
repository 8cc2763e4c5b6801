//! OTP challenge data model.

use secrecy::{ExposeSecret, SecretString};
use std::time::{Duration, Instant};

/// Key addressing one outstanding challenge.
///
/// At most one live challenge exists per `(subject, purpose)` pair; issuing
/// a new one overwrites the previous challenge for the same key.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ChallengeKey {
    subject: String,
    purpose: String,
}

impl ChallengeKey {
    #[must_use]
    pub fn new(subject: impl Into<String>, purpose: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            purpose: purpose.into(),
        }
    }

    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    #[must_use]
    pub fn purpose(&self) -> &str {
        &self.purpose
    }
}

/// One outstanding second-factor challenge.
///
/// Owned by the store and mutated only through the engine. The secret stays
/// wrapped until the comparison site so it never reaches logs.
#[derive(Clone, Debug)]
pub struct OtpChallenge {
    secret: SecretString,
    issued_at: Instant,
    expires_at: Instant,
    failure_count: u8,
}

impl OtpChallenge {
    pub(crate) fn new(secret: SecretString, ttl: Duration) -> Self {
        let issued_at = Instant::now();
        Self {
            secret,
            issued_at,
            expires_at: issued_at + ttl,
            failure_count: 0,
        }
    }

    /// Expiry is enforced lazily at read time; there is no background
    /// sweeper.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    #[must_use]
    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    #[must_use]
    pub fn failure_count(&self) -> u8 {
        self.failure_count
    }

    pub(crate) fn matches(&self, submitted: &str) -> bool {
        self.secret.expose_secret() == submitted
    }

    pub(crate) fn register_failure(&mut self) -> u8 {
        self.failure_count = self.failure_count.saturating_add(1);
        self.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::{ChallengeKey, OtpChallenge};
    use secrecy::SecretString;
    use std::time::Duration;

    fn challenge(secret: &str, ttl: Duration) -> OtpChallenge {
        OtpChallenge::new(SecretString::from(secret.to_string()), ttl)
    }

    #[test]
    fn key_carries_subject_and_purpose() {
        let key = ChallengeKey::new("u1", "login");
        assert_eq!(key.subject(), "u1");
        assert_eq!(key.purpose(), "login");
        assert_eq!(key, ChallengeKey::new("u1", "login"));
        assert_ne!(key, ChallengeKey::new("u1", "reset"));
    }

    #[test]
    fn fresh_challenge_has_no_failures() {
        let challenge = challenge("482913", Duration::from_secs(300));
        assert_eq!(challenge.failure_count(), 0);
        assert!(!challenge.is_expired());
        assert_eq!(challenge.expires_at() - challenge.issued_at(), Duration::from_secs(300));
    }

    #[test]
    fn matches_compares_the_exact_code() {
        let challenge = challenge("482913", Duration::from_secs(300));
        assert!(challenge.matches("482913"));
        assert!(!challenge.matches("000000"));
        assert!(!challenge.matches("48291"));
    }

    #[test]
    fn register_failure_increments() {
        let mut challenge = challenge("482913", Duration::from_secs(300));
        assert_eq!(challenge.register_failure(), 1);
        assert_eq!(challenge.register_failure(), 2);
        assert_eq!(challenge.register_failure(), 3);
        assert_eq!(challenge.failure_count(), 3);
    }

    #[test]
    fn zero_ttl_challenge_is_expired() {
        let challenge = challenge("482913", Duration::ZERO);
        assert!(challenge.is_expired());
    }
}

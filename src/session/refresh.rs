//! Single-flight coordination for access-token renewal.
//!
//! Flow Overview:
//! 1) The first request that sees a 401 consults the activity gate, becomes
//!    the leader of a refresh attempt and installs a shared outcome slot.
//! 2) Requests that see a 401 while the attempt is in flight subscribe to
//!    the same slot and suspend; no second refresh starts.
//! 3) On success the new token lands in the token cache before any waiter
//!    is released, so replays read the fresh token at send time.
//! 4) On failure, timeout or teardown every subscriber resolves exactly
//!    once with a terminal outcome, and the gate returns to idle so a later
//!    login can refresh again. The coordinator never wedges in the
//!    refreshing state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use super::activity::ActivityGate;
use super::tokens::{AccessSession, SessionTokenCache};

const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a refresh attempt did not produce a new token.
///
/// Remote rejection and transport failure both end the session; they are
/// deliberately not distinguished by downstream handling.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum RefreshError {
    #[error("refresh rejected ({status})")]
    Rejected { status: u16 },
    #[error("refresh transport failure: {0}")]
    Transport(String),
    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),
    #[error("session torn down while refreshing")]
    SessionClosed,
}

/// How a renewal request settled for one caller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RefreshOutcome {
    /// A fresh token is in the cache; replay the original request once.
    Refreshed,
    /// The user was idle; no refresh was attempted.
    SkippedInactive,
    /// The refresh settled without a token; each caller propagates its own
    /// original error.
    Failed(RefreshError),
}

/// The refresh endpoint call, behind a trait so transports and test stubs
/// are interchangeable.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<AccessSession, RefreshError>;
}

struct InFlightRefresh {
    generation: u64,
    outcome_tx: watch::Sender<Option<RefreshOutcome>>,
}

#[derive(Default)]
struct CoordinatorState {
    generation: u64,
    in_flight: Option<InFlightRefresh>,
}

enum Role {
    Leader {
        generation: u64,
        outcome_tx: watch::Sender<Option<RefreshOutcome>>,
    },
    Waiter(watch::Receiver<Option<RefreshOutcome>>),
}

/// Serializes concurrent refresh attempts: no matter how many requests
/// discover the expired token, exactly one renewal happens and every caller
/// resolves from its outcome.
pub struct RefreshCoordinator {
    tokens: Arc<SessionTokenCache>,
    activity: Arc<dyn ActivityGate>,
    refresh_timeout: Duration,
    state: Mutex<CoordinatorState>,
}

impl RefreshCoordinator {
    #[must_use]
    pub fn new(tokens: Arc<SessionTokenCache>, activity: Arc<dyn ActivityGate>) -> Self {
        Self {
            tokens,
            activity,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    #[must_use]
    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Renew the access token, or wait for the renewal already in flight.
    #[instrument(skip(self, refresher))]
    pub async fn renew(&self, refresher: Arc<dyn TokenRefresher>) -> RefreshOutcome {
        let role = {
            let mut state = self.state.lock().await;
            if let Some(attempt) = &state.in_flight {
                Role::Waiter(attempt.outcome_tx.subscribe())
            } else if self.activity.is_active() {
                state.generation += 1;
                let (outcome_tx, _) = watch::channel(None);
                state.in_flight = Some(InFlightRefresh {
                    generation: state.generation,
                    outcome_tx: outcome_tx.clone(),
                });
                Role::Leader {
                    generation: state.generation,
                    outcome_tx,
                }
            } else {
                // Expired while idle means the session is over; the caller
                // forces logout instead of renewing behind an absent user.
                info!("User inactive; skipping token refresh");
                return RefreshOutcome::SkippedInactive;
            }
        };

        match role {
            Role::Leader {
                generation,
                outcome_tx,
            } => self.lead(generation, outcome_tx, refresher).await,
            Role::Waiter(outcome_rx) => Self::wait(outcome_rx).await,
        }
    }

    /// Settle any in-flight attempt with a terminal outcome. Queued waiters
    /// must never outlive their session.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(attempt) = state.in_flight.take() {
            warn!("Releasing refresh waiters on session teardown");
            let _ = attempt
                .outcome_tx
                .send_replace(Some(RefreshOutcome::Failed(RefreshError::SessionClosed)));
        }
    }

    async fn lead(
        &self,
        generation: u64,
        outcome_tx: watch::Sender<Option<RefreshOutcome>>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> RefreshOutcome {
        let attempt = timeout(self.refresh_timeout, refresher.refresh()).await;

        let mut state = self.state.lock().await;
        let still_current = state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == generation);
        let outcome = if still_current {
            match attempt {
                Ok(Ok(session)) => {
                    // The cache must hold the new token before any waiter
                    // wakes and replays.
                    self.tokens.replace(session).await;
                    info!("Access token refreshed");
                    RefreshOutcome::Refreshed
                }
                Ok(Err(err)) => {
                    error!("Token refresh failed: {err}");
                    RefreshOutcome::Failed(err)
                }
                Err(_) => {
                    error!(
                        timeout_seconds = self.refresh_timeout.as_secs(),
                        "Token refresh timed out"
                    );
                    RefreshOutcome::Failed(RefreshError::TimedOut(self.refresh_timeout))
                }
            }
        } else {
            // The session was torn down mid-flight; a late token must not
            // resurrect it.
            RefreshOutcome::Failed(RefreshError::SessionClosed)
        };
        if still_current {
            state.in_flight = None;
        }
        drop(state);

        let _ = outcome_tx.send_replace(Some(outcome.clone()));
        outcome
    }

    async fn wait(mut outcome_rx: watch::Receiver<Option<RefreshOutcome>>) -> RefreshOutcome {
        loop {
            if let Some(outcome) = outcome_rx.borrow_and_update().clone() {
                return outcome;
            }
            if outcome_rx.changed().await.is_err() {
                // Leader dropped without settling; treat as teardown.
                return RefreshOutcome::Failed(RefreshError::SessionClosed);
            }
        }
    }
}

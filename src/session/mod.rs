//! Client-side session security: token cache, activity gate, single-flight
//! refresh coordination and the request pipeline that ties them together.
//!
//! Flow Overview:
//! 1) The pipeline stamps outbound requests from the token cache at send
//!    time.
//! 2) On a 401 it consults the activity gate and enters the single-flight
//!    refresh coordinator; concurrent discoveries of the expired token
//!    share one renewal.
//! 3) The coordinator writes the renewed token into the cache before
//!    releasing waiters; the pipeline replays each affected request exactly
//!    once.
//! 4) Failures force logout with a reason code consumed by the navigation
//!    layer; teardown releases any queued waiters.
//!
//! This module touches security boundaries and must avoid logging secrets
//! or token material.

pub mod activity;
pub mod client;
pub mod refresh;
pub mod tokens;

pub use activity::{ActivityGate, AlwaysActiveGate, RecentActivityGate};
pub use client::{HttpTokenRefresher, PipelineError, RequestPipeline};
pub use refresh::{RefreshCoordinator, RefreshError, RefreshOutcome, TokenRefresher};
pub use tokens::{AccessSession, SessionTokenCache};

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Session lifecycle phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionPhase {
    LoggedOut,
    Authenticating,
    Authenticated,
    Refreshing,
}

impl SessionPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Refreshing => "refreshing",
        }
    }
}

/// Why a session was forcibly ended.
///
/// The navigation layer routes each reason to a different user-facing
/// state; all of them clear the session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogoutReason {
    /// The access token expired and could not (or should not) be renewed.
    SessionExpired,
    /// The server rejected an authenticated request outright.
    SecurityViolation,
    /// The backend is down for maintenance.
    Maintenance,
}

impl LogoutReason {
    /// Human-readable reason for logs and the navigation layer.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionExpired => "session_expired",
            Self::SecurityViolation => "security_violation",
            Self::Maintenance => "maintenance",
        }
    }
}

/// Composition root for one authenticated session: token cache, refresh
/// coordinator and logout signaling.
///
/// There is no process-wide refresh state; every handle is independent, so
/// tests can run any number of sessions without cross-talk.
pub struct SessionHandle {
    tokens: Arc<SessionTokenCache>,
    coordinator: Arc<RefreshCoordinator>,
    logout_tx: mpsc::UnboundedSender<LogoutReason>,
    phase_tx: watch::Sender<SessionPhase>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(
        tokens: Arc<SessionTokenCache>,
        coordinator: Arc<RefreshCoordinator>,
        logout_tx: mpsc::UnboundedSender<LogoutReason>,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SessionPhase::LoggedOut);
        Self {
            tokens,
            coordinator,
            logout_tx,
            phase_tx,
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &SessionTokenCache {
        &self.tokens
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        *self.phase_tx.borrow()
    }

    /// Subscribe to phase transitions; navigation layers typically watch
    /// for `LoggedOut`.
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase_tx.subscribe()
    }

    /// Mark the start of an interactive login.
    pub fn begin_login(&self) {
        let _ = self.phase_tx.send_replace(SessionPhase::Authenticating);
    }

    /// Install the credential set produced by a completed login.
    pub async fn login(&self, session: AccessSession) {
        self.tokens.replace(session).await;
        let _ = self.phase_tx.send_replace(SessionPhase::Authenticated);
        info!("Session authenticated");
    }

    /// Voluntary logout: clears the credential set and releases any queued
    /// refresh waiters.
    pub async fn logout(&self) {
        let _ = self.phase_tx.send_replace(SessionPhase::LoggedOut);
        self.coordinator.shutdown().await;
        self.tokens.clear().await;
        info!("Session logged out");
    }

    /// Forced logout with a reason for the navigation layer. Emits the
    /// reason at most once per teardown, no matter how many requests fail
    /// simultaneously.
    pub async fn force_logout(&self, reason: LogoutReason) {
        let previous = self.phase_tx.send_replace(SessionPhase::LoggedOut);
        if previous == SessionPhase::LoggedOut {
            return;
        }
        warn!(reason = reason.as_str(), "Forcing logout");
        self.coordinator.shutdown().await;
        self.tokens.clear().await;
        let _ = self.logout_tx.send(reason);
    }

    /// Renew the access token through the single-flight coordinator and map
    /// the outcome onto the session lifecycle.
    pub(crate) async fn renew(&self, refresher: Arc<dyn TokenRefresher>) -> RefreshOutcome {
        if self.phase() == SessionPhase::LoggedOut {
            return RefreshOutcome::Failed(RefreshError::SessionClosed);
        }
        let _ = self.phase_tx.send_replace(SessionPhase::Refreshing);
        let outcome = self.coordinator.renew(refresher).await;
        match &outcome {
            RefreshOutcome::Refreshed => {
                let _ = self.phase_tx.send_replace(SessionPhase::Authenticated);
            }
            RefreshOutcome::SkippedInactive | RefreshOutcome::Failed(_) => {
                self.force_logout(LogoutReason::SessionExpired).await;
            }
        }
        outcome
    }
}

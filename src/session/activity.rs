//! Recent-user-activity tracking for the refresh gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Reports whether the user interacted recently.
///
/// The refresh coordinator consults this before starting a renewal: a token
/// that expired while the user was idle ends the session instead of being
/// silently renewed.
pub trait ActivityGate: Send + Sync {
    fn is_active(&self) -> bool;
}

/// Gate that always reports activity, for embedders without input tracking.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysActiveGate;

impl ActivityGate for AlwaysActiveGate {
    fn is_active(&self) -> bool {
        true
    }
}

/// Tracks the timestamp of the last recorded interaction.
///
/// A freshly constructed gate counts as active; sessions start with a user
/// present.
pub struct RecentActivityGate {
    epoch: Instant,
    idle_window: Duration,
    last_activity_ms: AtomicU64,
}

impl RecentActivityGate {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            idle_window: DEFAULT_IDLE_WINDOW,
            last_activity_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_idle_window(mut self, idle_window: Duration) -> Self {
        self.idle_window = idle_window;
        self
    }

    /// Called by the embedder on user interaction (navigation, input,
    /// pointer events).
    pub fn record_activity(&self) {
        self.last_activity_ms
            .store(self.elapsed_ms(), Ordering::Relaxed);
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for RecentActivityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityGate for RecentActivityGate {
    fn is_active(&self) -> bool {
        let now = self.elapsed_ms();
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        let window = u64::try_from(self.idle_window.as_millis()).unwrap_or(u64::MAX);
        now.saturating_sub(last) <= window
    }
}

//! Authentication session security core.
//!
//! Two halves of the same trust boundary: a server-side one-time-passcode
//! (OTP) challenge engine used as a second authentication factor, and a
//! client-side coordinator that serializes access-token refreshes across
//! concurrent in-flight requests and replays them.

pub mod otp;
pub mod session;

pub use otp::{
    ChallengeKey, ChallengeStore, MemoryChallengeStore, OtpChallenge, OtpChallengeEngine,
    OtpConfig,
};
pub use session::{
    AccessSession, ActivityGate, AlwaysActiveGate, HttpTokenRefresher, LogoutReason,
    PipelineError, RecentActivityGate, RefreshCoordinator, RefreshError, RefreshOutcome,
    RequestPipeline, SessionHandle, SessionPhase, SessionTokenCache, TokenRefresher,
};

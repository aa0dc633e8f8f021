//! Authentication core: credentials, adaptive risk, sessions, and tokens.
//!
//! Provides:
//! - Password verification with rate limiting, lockout, and risk-adaptive
//!   MFA step-up
//! - Distributed session lifecycle over a durable store plus a
//!   cache-authoritative fast path
//! - Bearer tokens bound to sessions, so revocation is instant
//! - TOTP enrollment, login challenges, and single-use backup codes

pub mod attempts;
pub mod authenticator;
pub mod credentials;
pub mod mfa;
pub mod rate_limit;
pub mod risk;
pub mod session;
pub mod storage_pg;
pub mod token;

pub use attempts::{AttemptStore, AttemptWindow, LoginAttempt, MemoryAttemptStore};
pub use authenticator::{AuthOutcome, AuthRequest, AuthenticatedLogin, Authenticator};
pub use credentials::{CredentialStore, MemoryCredentialStore, UserCredential};
pub use mfa::{MfaCoordinator, MfaSetup, VerifiedChallenge};
pub use rate_limit::{ActionClass, LockoutGuard, RateLimiter};
pub use risk::{GeoLookup, Location, NoGeoLookup, RiskAssessment, RiskScorer};
pub use session::{MemorySessionStore, Session, SessionManager, SessionStatus, SessionStore};
pub use storage_pg::{PostgresAttemptStore, PostgresCredentialStore, PostgresSessionStore};
pub use token::{Claims, TokenPair, TokenService, TokenType};

//! The login orchestrator.
//!
//! One struct owns the whole decision chain: rate limit, lockout, password
//! check, risk score, MFA branch, session, tokens. Terminal credential
//! failures all collapse to the same `InvalidCredentials` so a caller
//! cannot tell a wrong password from an unknown email; rate limiting and
//! lockout are the deliberate exceptions, since hiding those would only
//! invite retries. The whole flow runs under a deadline, so no backend
//! outage can hang a login forever.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use aegis_core::{Error, Result};
use aegis_crypto::PasswordHasher;

use crate::attempts::{AttemptStore, LoginAttempt};
use crate::credentials::{CredentialStore, UserCredential};
use crate::mfa::MfaCoordinator;
use crate::rate_limit::{ActionClass, LockoutGuard, RateLimiter};
use crate::risk::{RiskAssessment, RiskScorer};
use crate::session::{Session, SessionManager};
use crate::token::{TokenPair, TokenService};

/// Everything a login attempt arrives with.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub email: String,
    pub password: String,
    pub device_fingerprint: String,
    pub origin_address: String,
    pub user_agent: String,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .field("device_fingerprint", &self.device_fingerprint)
            .field("origin_address", &self.origin_address)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// A fully completed login.
#[derive(Debug, Clone)]
pub struct AuthenticatedLogin {
    pub user_id: Uuid,
    pub session_id: String,
    pub tokens: TokenPair,
    pub risk_score: f64,
}

/// What a login attempt produced.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// Session registered and tokens minted.
    Authenticated(AuthenticatedLogin),
    /// Password was right but a second factor is required. No session
    /// exists yet; the handle is the only path forward.
    MfaRequired {
        user_id: Uuid,
        challenge_handle: String,
        risk_score: f64,
    },
}

/// Orchestrates authentication end to end.
pub struct Authenticator {
    credentials: Arc<dyn CredentialStore>,
    attempts: Arc<dyn AttemptStore>,
    hasher: PasswordHasher,
    rate_limiter: RateLimiter,
    lockout: LockoutGuard,
    risk: RiskScorer,
    sessions: Arc<SessionManager>,
    tokens: Arc<TokenService>,
    mfa: MfaCoordinator,
    /// Deadline for one whole login flow, in milliseconds
    login_flow_ms: u64,
}

impl Authenticator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        attempts: Arc<dyn AttemptStore>,
        hasher: PasswordHasher,
        rate_limiter: RateLimiter,
        lockout: LockoutGuard,
        risk: RiskScorer,
        sessions: Arc<SessionManager>,
        tokens: Arc<TokenService>,
        mfa: MfaCoordinator,
        login_flow_ms: u64,
    ) -> Self {
        Self {
            credentials,
            attempts,
            hasher,
            rate_limiter,
            lockout,
            risk,
            sessions,
            tokens,
            mfa,
            login_flow_ms,
        }
    }

    async fn deadline<T>(&self, what: &str, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(StdDuration::from_millis(self.login_flow_ms), op).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    security = true,
                    flow = what,
                    timeout_ms = self.login_flow_ms,
                    "Authentication flow timed out"
                );
                Err(Error::TransientStore {
                    message: format!("{} exceeded {}ms", what, self.login_flow_ms),
                })
            }
        }
    }

    /// Authenticate a credential pair under the configured deadline.
    pub async fn authenticate(&self, request: AuthRequest) -> Result<AuthOutcome> {
        self.deadline("login", self.authenticate_inner(&request)).await
    }

    async fn authenticate_inner(&self, request: &AuthRequest) -> Result<AuthOutcome> {
        let email = request.email.trim().to_lowercase();

        self.rate_limiter.check(ActionClass::Login, &email).await?;
        self.lockout.check_email(&email).await?;

        let credential = match self.credentials.find_by_email(&email).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                self.record_failure(None, &email, &request.origin_address, "unknown email")
                    .await;
                return Err(Error::InvalidCredentials);
            }
            Err(e) => {
                // The caller sees the same generic failure as a bad password
                warn!(security = true, email = %email, error = %e, "Credential lookup failed");
                return Err(Error::InvalidCredentials);
            }
        };

        let password_ok = match self
            .hasher
            .verify(&request.password, &credential.password_hash)
        {
            Ok(ok) => ok,
            Err(e) => {
                warn!(
                    security = true,
                    user_id = %credential.user_id,
                    error = %e,
                    "Stored password hash unreadable"
                );
                false
            }
        };
        if !password_ok {
            self.record_failure(
                Some(credential.user_id),
                &email,
                &request.origin_address,
                "bad password",
            )
            .await;
            return Err(Error::InvalidCredentials);
        }

        let assessment = self
            .risk
            .assess(
                credential.user_id,
                &request.device_fingerprint,
                &request.origin_address,
                &request.user_agent,
            )
            .await;

        if credential.mfa_enabled || self.risk.requires_step_up(assessment.score) {
            let handle = self
                .mfa
                .begin_challenge(
                    credential.user_id,
                    &request.device_fingerprint,
                    &request.origin_address,
                )
                .await?;
            info!(
                security = true,
                user_id = %credential.user_id,
                risk_score = assessment.score,
                mfa_enrolled = credential.mfa_enabled,
                "Login pending second factor"
            );
            return Ok(AuthOutcome::MfaRequired {
                user_id: credential.user_id,
                challenge_handle: handle,
                risk_score: assessment.score,
            });
        }

        let login = self
            .finish_login(
                &credential,
                &request.device_fingerprint,
                &request.origin_address,
                &request.user_agent,
                &assessment,
            )
            .await?;
        Ok(AuthOutcome::Authenticated(login))
    }

    /// Answer an open MFA challenge and, on success, complete the login
    /// exactly as a password-only flow would have.
    pub async fn verify_mfa(
        &self,
        user_id: Uuid,
        challenge_handle: &str,
        code: &str,
        user_agent: &str,
    ) -> Result<AuthOutcome> {
        self.deadline(
            "mfa verification",
            self.verify_mfa_inner(user_id, challenge_handle, code, user_agent),
        )
        .await
    }

    async fn verify_mfa_inner(
        &self,
        user_id: Uuid,
        challenge_handle: &str,
        code: &str,
        user_agent: &str,
    ) -> Result<AuthOutcome> {
        self.rate_limiter
            .check(ActionClass::MfaVerify, &user_id.to_string())
            .await?;

        let credential = self
            .credentials
            .find_by_id(user_id)
            .await?
            .ok_or(Error::InvalidCredentials)?;

        let verified = match self.mfa.verify_code(user_id, challenge_handle, code).await {
            Ok(verified) => verified,
            Err(Error::InvalidMfaCode) => {
                self.record_failure(
                    Some(user_id),
                    &credential.email,
                    "unknown",
                    "invalid MFA code",
                )
                .await;
                return Err(Error::InvalidMfaCode);
            }
            Err(e) => return Err(e),
        };

        // Device and origin come from the challenge, which captured them
        // when the password was verified
        let assessment = self
            .risk
            .assess(
                user_id,
                &verified.device_fingerprint,
                &verified.origin_address,
                user_agent,
            )
            .await;

        let login = self
            .finish_login(
                &credential,
                &verified.device_fingerprint,
                &verified.origin_address,
                user_agent,
                &assessment,
            )
            .await?;
        Ok(AuthOutcome::Authenticated(login))
    }

    async fn finish_login(
        &self,
        credential: &UserCredential,
        device_fingerprint: &str,
        origin_address: &str,
        user_agent: &str,
        assessment: &RiskAssessment,
    ) -> Result<AuthenticatedLogin> {
        let session = self
            .sessions
            .create(
                credential.user_id,
                device_fingerprint,
                origin_address,
                user_agent,
                assessment.score,
                assessment.location.display(),
            )
            .await?;

        let tokens = self.tokens.issue_pair(credential.user_id, &session.session_id)?;

        self.record_success(credential.user_id, &credential.email, origin_address)
            .await;
        info!(
            security = true,
            user_id = %credential.user_id,
            session_id = %session.session_id,
            risk_score = assessment.score,
            "Login succeeded"
        );

        Ok(AuthenticatedLogin {
            user_id: credential.user_id,
            session_id: session.session_id,
            tokens,
            risk_score: assessment.score,
        })
    }

    async fn record_failure(
        &self,
        user_id: Option<Uuid>,
        email: &str,
        origin_address: &str,
        details: &str,
    ) {
        let mut builder = LoginAttempt::builder(email, origin_address).failure(details);
        if let Some(id) = user_id {
            builder = builder.user_id(id);
        }
        if let Err(e) = self.attempts.record(&builder.build()).await {
            warn!(security = true, email = %email, error = %e, "Failed to record login attempt");
        }
        warn!(security = true, email = %email, details = %details, "Login failed");
    }

    async fn record_success(&self, user_id: Uuid, email: &str, origin_address: &str) {
        let attempt = LoginAttempt::builder(email, origin_address)
            .user_id(user_id)
            .success()
            .build();
        if let Err(e) = self.attempts.record(&attempt).await {
            warn!(security = true, email = %email, error = %e, "Failed to record login attempt");
        }
    }

    /// Revoke one session. True when a session existed.
    pub async fn logout(&self, session_id: &str) -> Result<bool> {
        self.sessions.revoke(session_id).await
    }

    /// Revoke every active session the user has.
    pub async fn logout_all(&self, user_id: Uuid) -> Result<u32> {
        self.sessions.revoke_all(user_id).await
    }

    /// All sessions on record for the user, newest first.
    pub async fn sessions_for(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.sessions.sessions_for(user_id).await
    }

    /// Recent login attempts for account-activity views.
    pub async fn recent_attempts(&self, user_id: Uuid, limit: i64) -> Result<Vec<LoginAttempt>> {
        self.attempts.recent_for_user(user_id, limit).await
    }

    /// Gate for password-reset request endpoints. Counts the request
    /// against the reset window whether or not the email resolves.
    pub async fn check_password_reset_allowed(&self, email: &str) -> Result<()> {
        self.rate_limiter
            .check(ActionClass::PasswordReset, email)
            .await
    }

    /// Change a password, which revokes every session the user has.
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        let credential = self
            .credentials
            .find_by_id(user_id)
            .await?
            .ok_or(Error::InvalidCredentials)?;

        let current_ok = self
            .hasher
            .verify(current_password, &credential.password_hash)
            .unwrap_or(false);
        if !current_ok {
            self.record_failure(
                Some(user_id),
                &credential.email,
                "unknown",
                "password change with wrong password",
            )
            .await;
            return Err(Error::InvalidCredentials);
        }

        let new_hash = self.hasher.hash(new_password)?;
        self.credentials.update_password(user_id, &new_hash).await?;
        let revoked = self.sessions.revoke_all(user_id).await?;

        info!(
            security = true,
            user_id = %user_id,
            revoked_sessions = revoked,
            "Password changed"
        );
        Ok(())
    }
}

//! Sliding-window rate limiting and failure-driven lockout.
//!
//! Rate limiting rides on the cache's atomic windowed counter, so concurrent
//! checks against one identifier cannot both pass at the limit. Lockout is
//! recomputed from the attempt log on every check; nothing is stored, so a
//! lockout ends on its own once the failures age out of the window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use aegis_core::config::{LockoutConfig, RateLimitConfig, TimeoutConfig};
use aegis_core::{Cache, Error, Result};

use crate::attempts::{AttemptStore, AttemptWindow};

/// Sensitive action classes, each with its own limit and window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Login,
    PasswordReset,
    MfaVerify,
}

impl ActionClass {
    /// Name used in counter keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::Login => "login",
            ActionClass::PasswordReset => "password_reset",
            ActionClass::MfaVerify => "2fa_verify",
        }
    }
}

/// Per-identifier windowed counters over the shared cache.
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    config: RateLimitConfig,
    timeouts: TimeoutConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, config: RateLimitConfig, timeouts: TimeoutConfig) -> Self {
        Self {
            cache,
            config,
            timeouts,
        }
    }

    fn limits(&self, action: ActionClass) -> (u32, Duration) {
        match action {
            ActionClass::Login => (
                self.config.login_limit,
                Duration::from_secs(self.config.login_window_secs),
            ),
            ActionClass::PasswordReset => (
                self.config.password_reset_limit,
                Duration::from_secs(self.config.password_reset_window_secs),
            ),
            ActionClass::MfaVerify => (
                self.config.mfa_verify_limit,
                Duration::from_secs(self.config.mfa_verify_window_secs),
            ),
        }
    }

    /// Count one action against the identifier's window.
    ///
    /// Returns `Err(RateLimited)` once the window is full. A cache error or
    /// timeout allows the action instead of refusing every login while the
    /// counter backend is down; the degradation is logged.
    pub async fn check(&self, action: ActionClass, identifier: &str) -> Result<()> {
        let (limit, window) = self.limits(action);
        let key = format!("ratelimit:{}:{}", action.as_str(), identifier.to_lowercase());

        let op = self.cache.incr_window(&key, limit, window);
        match tokio::time::timeout(Duration::from_millis(self.timeouts.cache_op_ms), op).await {
            Ok(Ok(decision)) if decision.allowed => Ok(()),
            Ok(Ok(decision)) => {
                warn!(
                    security = true,
                    action = action.as_str(),
                    identifier = %identifier,
                    count = decision.count,
                    retry_after_secs = decision.retry_after_secs,
                    "Rate limit exceeded"
                );
                Err(Error::RateLimited {
                    retry_after_secs: decision.retry_after_secs,
                })
            }
            Ok(Err(e)) => {
                warn!(
                    security = true,
                    action = action.as_str(),
                    error = %e,
                    "Rate limit backend unavailable, allowing action"
                );
                Ok(())
            }
            Err(_) => {
                warn!(
                    security = true,
                    action = action.as_str(),
                    timeout_ms = self.timeouts.cache_op_ms,
                    "Rate limit check timed out, allowing action"
                );
                Ok(())
            }
        }
    }
}

/// Refuses authentication for identifiers with too many recent failures.
pub struct LockoutGuard {
    attempts: Arc<dyn AttemptStore>,
    config: LockoutConfig,
}

impl LockoutGuard {
    pub fn new(attempts: Arc<dyn AttemptStore>, config: LockoutConfig) -> Self {
        Self { attempts, config }
    }

    fn window_start(&self) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(self.config.window_minutes)
    }

    /// Check by email, covering attempts that never resolved to an account.
    pub async fn check_email(&self, email: &str) -> Result<()> {
        let window = self
            .attempts
            .window_for_email(email, self.window_start())
            .await?;
        self.evaluate(&window, email)
    }

    pub async fn check_user(&self, user_id: Uuid) -> Result<()> {
        let window = self
            .attempts
            .window_for_user(user_id, self.window_start())
            .await?;
        self.evaluate(&window, &user_id.to_string())
    }

    fn evaluate(&self, window: &AttemptWindow, identifier: &str) -> Result<()> {
        if window.failures >= self.config.max_failures {
            warn!(
                security = true,
                identifier = %identifier,
                failures = window.failures,
                window_minutes = self.config.window_minutes,
                "Account locked out"
            );
            return Err(Error::AccountLocked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::{LoginAttempt, MemoryAttemptStore};
    use aegis_core::MemoryCache;
    use async_trait::async_trait;

    struct FailingCache;

    #[async_trait]
    impl Cache for FailingCache {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(Error::TransientStore {
                message: "cache down".to_string(),
            })
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            Err(Error::TransientStore {
                message: "cache down".to_string(),
            })
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(Error::TransientStore {
                message: "cache down".to_string(),
            })
        }

        async fn exists(&self, _key: &str) -> Result<bool> {
            Err(Error::TransientStore {
                message: "cache down".to_string(),
            })
        }

        async fn incr_window(
            &self,
            _key: &str,
            _limit: u32,
            _window: Duration,
        ) -> Result<aegis_core::WindowDecision> {
            Err(Error::TransientStore {
                message: "cache down".to_string(),
            })
        }
    }

    fn limiter(cache: Arc<dyn Cache>) -> RateLimiter {
        RateLimiter::new(cache, RateLimitConfig::default(), TimeoutConfig::default())
    }

    #[tokio::test]
    async fn test_allows_up_to_limit_then_denies() {
        let limiter = limiter(Arc::new(MemoryCache::new()));
        let config = RateLimitConfig::default();

        for _ in 0..config.login_limit {
            limiter
                .check(ActionClass::Login, "alice@example.com")
                .await
                .unwrap();
        }

        let denied = limiter.check(ActionClass::Login, "alice@example.com").await;
        match denied {
            Err(Error::RateLimited { retry_after_secs }) => {
                assert!(retry_after_secs > 0);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_identifiers_have_independent_windows() {
        let limiter = limiter(Arc::new(MemoryCache::new()));
        let config = RateLimitConfig::default();

        for _ in 0..config.login_limit {
            limiter
                .check(ActionClass::Login, "alice@example.com")
                .await
                .unwrap();
        }

        // A different identifier is unaffected
        limiter
            .check(ActionClass::Login, "bob@example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_action_classes_have_independent_windows() {
        let limiter = limiter(Arc::new(MemoryCache::new()));
        let config = RateLimitConfig::default();

        for _ in 0..config.password_reset_limit {
            limiter
                .check(ActionClass::PasswordReset, "alice@example.com")
                .await
                .unwrap();
        }

        // Reset exhaustion must not block login
        limiter
            .check(ActionClass::Login, "alice@example.com")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_identifier_casing_shares_a_window() {
        let limiter = limiter(Arc::new(MemoryCache::new()));
        let config = RateLimitConfig::default();

        for _ in 0..config.login_limit {
            limiter
                .check(ActionClass::Login, "Alice@Example.com")
                .await
                .unwrap();
        }

        let denied = limiter.check(ActionClass::Login, "alice@example.com").await;
        assert!(matches!(denied, Err(Error::RateLimited { .. })));
    }

    #[tokio::test]
    async fn test_cache_failure_degrades_to_allow() {
        let limiter = limiter(Arc::new(FailingCache));

        // Far past any limit, every call still passes
        for _ in 0..20 {
            limiter
                .check(ActionClass::Login, "alice@example.com")
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_lockout_after_repeated_failures() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let config = LockoutConfig::default();
        let guard = LockoutGuard::new(attempts.clone(), config.clone());
        let user_id = Uuid::new_v4();

        for _ in 0..config.max_failures {
            let attempt = LoginAttempt::builder("a@b.com", "203.0.113.7")
                .user_id(user_id)
                .failure("bad password")
                .build();
            attempts.record(&attempt).await.unwrap();
        }

        assert!(matches!(
            guard.check_user(user_id).await,
            Err(Error::AccountLocked)
        ));
        assert!(matches!(
            guard.check_email("a@b.com").await,
            Err(Error::AccountLocked)
        ));
    }

    #[tokio::test]
    async fn test_lockout_expires_with_the_window() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let config = LockoutConfig::default();
        let guard = LockoutGuard::new(attempts.clone(), config.clone());
        let user_id = Uuid::new_v4();

        // All failures predate the lockout window
        for _ in 0..config.max_failures + 2 {
            let mut attempt = LoginAttempt::builder("a@b.com", "203.0.113.7")
                .user_id(user_id)
                .failure("bad password")
                .build();
            attempt.timestamp = Utc::now() - ChronoDuration::minutes(config.window_minutes + 5);
            attempts.record(&attempt).await.unwrap();
        }

        guard.check_user(user_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lockout_ignores_successes() {
        let attempts = Arc::new(MemoryAttemptStore::new());
        let guard = LockoutGuard::new(attempts.clone(), LockoutConfig::default());
        let user_id = Uuid::new_v4();

        for _ in 0..20 {
            let attempt = LoginAttempt::builder("a@b.com", "203.0.113.7")
                .user_id(user_id)
                .success()
                .build();
            attempts.record(&attempt).await.unwrap();
        }

        guard.check_user(user_id).await.unwrap();
    }
}

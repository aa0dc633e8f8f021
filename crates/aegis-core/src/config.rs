//! Configuration for the Aegis security core.
//!
//! Every tunable lives here with an explicit default; `from_env` overlays
//! environment variables and `validate` rejects inconsistent settings at startup.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Top-level configuration aggregating every component's tunables.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitConfig,
    pub lockout: LockoutConfig,
    pub risk: RiskConfig,
    pub session: SessionConfig,
    pub token: TokenConfig,
    pub mfa: MfaConfig,
    pub rbac: RbacConfig,
    pub timeouts: TimeoutConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Upper bound on waiting for a pooled connection, in seconds.
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/aegis".to_string(),
            max_connections: 5,
            acquire_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Fixed-window limits per action class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Login attempts allowed per identifier per window.
    pub login_limit: u32,
    /// Login window length in seconds.
    pub login_window_secs: u64,
    /// Password reset requests allowed per identifier per window.
    pub password_reset_limit: u32,
    /// Password reset window length in seconds.
    pub password_reset_window_secs: u64,
    /// MFA code submissions allowed per identifier per window.
    pub mfa_verify_limit: u32,
    /// MFA verification window length in seconds.
    pub mfa_verify_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_limit: 5,                    // 5 per 5 minutes
            login_window_secs: 300,
            password_reset_limit: 3,           // 3 per hour
            password_reset_window_secs: 3600,
            mfa_verify_limit: 10,              // 10 per 5 minutes
            mfa_verify_window_secs: 300,
        }
    }
}

/// Lockout derived from the login-attempt log, recomputed on every check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Failed attempts within the window that trigger a lockout.
    pub max_failures: u32,
    /// Rolling window length in minutes.
    pub window_minutes: i64,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,     // locked after 5 failures
            window_minutes: 30,  // within 30 minutes
        }
    }
}

/// Additive risk-score weights, capped at 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Added when the device fingerprint has never been seen for this user.
    pub new_device_weight: f64,
    /// Added when the device has been seen but fewer than `familiar_device_uses` times.
    pub rare_device_weight: f64,
    /// Sessions required before a device counts as familiar.
    pub familiar_device_uses: i64,
    /// Added when the origin address has never been seen for this user.
    pub new_origin_weight: f64,
    /// Added when the current UTC hour falls outside [day_start_hour, day_end_hour).
    pub odd_hours_weight: f64,
    /// Start of normal hours (UTC).
    pub day_start_hour: u32,
    /// End of normal hours (UTC).
    pub day_end_hour: u32,
    /// Added per failed attempt in the trailing 24h.
    pub failed_attempt_weight: f64,
    /// Ceiling on the failed-attempt contribution.
    pub failed_attempt_cap: f64,
    /// Score reported when history cannot be read.
    pub fallback_score: f64,
    /// Scores strictly above this demand MFA step-up.
    pub step_up_threshold: f64,
    /// Whether high-risk step-up is enforced at all.
    pub step_up_enabled: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            new_device_weight: 0.3,
            rare_device_weight: 0.1,
            familiar_device_uses: 5,
            new_origin_weight: 0.2,
            odd_hours_weight: 0.1,
            day_start_hour: 6,   // 06:00 UTC
            day_end_hour: 22,    // 22:00 UTC
            failed_attempt_weight: 0.1,
            failed_attempt_cap: 0.3,
            fallback_score: 0.5, // conservative default when history is unreadable
            step_up_threshold: 0.6,
            step_up_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in hours; also the cache mirror TTL.
    pub lifetime_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// HMAC signing secret for bearer tokens.
    pub secret: String,
    /// Access token lifetime in seconds.
    pub access_ttl_secs: i64,
    /// Refresh token lifetime in days.
    pub refresh_ttl_days: i64,
    /// Issuer claim stamped into and required from every token.
    pub issuer: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: "change-me-in-production".to_string(),
            access_ttl_secs: 3600,  // 1 hour
            refresh_ttl_days: 30,
            issuer: "aegis".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaConfig {
    /// TTL for a pending challenge handle, in seconds.
    pub challenge_ttl_secs: u64,
    /// TTL for a pending (unconfirmed) TOTP setup, in seconds.
    pub pending_setup_ttl_secs: u64,
    /// Wrong codes tolerated before a challenge handle is destroyed.
    pub max_challenge_failures: u32,
    /// Backup codes issued on setup.
    pub backup_code_count: usize,
    /// Adjacent TOTP steps accepted around the current one (clock skew).
    pub totp_skew_steps: u8,
    /// Issuer rendered into provisioning URIs.
    pub issuer: String,
}

impl Default for MfaConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: 300,      // 5 minutes
            pending_setup_ttl_secs: 300,  // 5 minutes
            max_challenge_failures: 5,
            backup_code_count: 8,
            totp_skew_steps: 1,
            issuer: "Aegis".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbacConfig {
    /// Per-user permission cache TTL in seconds.
    pub permission_cache_ttl_secs: u64,
    /// Context amounts at or above this value escalate the decision risk label.
    pub high_risk_amount: u64,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            permission_cache_ttl_secs: 900, // 15 minutes
            high_risk_amount: 10_000,
        }
    }
}

/// Bounds on every suspension point; none of these calls may block a login
/// indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Single cache operation.
    pub cache_op_ms: u64,
    /// Single durable-store operation.
    pub store_op_ms: u64,
    /// Geolocation lookup; on expiry the location degrades to unknown.
    pub geo_lookup_ms: u64,
    /// Whole authentication attempt, end to end.
    pub login_flow_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            cache_op_ms: 500,
            store_op_ms: 2000,
            geo_lookup_ms: 800,
            login_flow_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Path of the master key file protecting stored key material.
    pub master_key_path: String,
    /// Argon2 memory cost in KiB.
    pub argon2_memory_kib: u32,
    /// Argon2 iteration count.
    pub argon2_iterations: u32,
    /// Argon2 lane count.
    pub argon2_parallelism: u32,
    /// Modulus size for generated RSA keys.
    pub rsa_bits: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            master_key_path: "./aegis_master.key".to_string(),
            argon2_memory_kib: 19456, // 19 MiB
            argon2_iterations: 2,
            argon2_parallelism: 1,
            rsa_bits: 2048,
        }
    }
}

impl SecurityConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let config = Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.database.max_connections),
                acquire_timeout_secs: env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.database.acquire_timeout_secs),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or(defaults.redis.url),
            },
            rate_limit: RateLimitConfig {
                login_limit: env::var("RATE_LIMIT_LOGIN")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.rate_limit.login_limit),
                login_window_secs: env::var("RATE_LIMIT_LOGIN_WINDOW_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.rate_limit.login_window_secs),
                ..defaults.rate_limit
            },
            lockout: LockoutConfig {
                max_failures: env::var("LOCKOUT_MAX_FAILURES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.lockout.max_failures),
                window_minutes: env::var("LOCKOUT_WINDOW_MINUTES")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.lockout.window_minutes),
            },
            risk: RiskConfig {
                step_up_threshold: env::var("RISK_STEP_UP_THRESHOLD")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.risk.step_up_threshold),
                step_up_enabled: env::var("RISK_STEP_UP_ENABLED")
                    .ok()
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(defaults.risk.step_up_enabled),
                ..defaults.risk
            },
            session: SessionConfig {
                lifetime_hours: env::var("SESSION_LIFETIME_HOURS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.session.lifetime_hours),
            },
            token: TokenConfig {
                secret: env::var("JWT_SECRET").unwrap_or(defaults.token.secret),
                access_ttl_secs: env::var("ACCESS_TOKEN_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.token.access_ttl_secs),
                refresh_ttl_days: env::var("REFRESH_TOKEN_TTL_DAYS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.token.refresh_ttl_days),
                issuer: env::var("JWT_ISSUER").unwrap_or(defaults.token.issuer),
            },
            mfa: defaults.mfa,
            rbac: RbacConfig {
                permission_cache_ttl_secs: env::var("RBAC_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.rbac.permission_cache_ttl_secs),
                high_risk_amount: env::var("RBAC_HIGH_RISK_AMOUNT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.rbac.high_risk_amount),
            },
            timeouts: defaults.timeouts,
            crypto: CryptoConfig {
                master_key_path: env::var("AEGIS_MASTER_KEY_PATH")
                    .unwrap_or(defaults.crypto.master_key_path),
                ..defaults.crypto
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would silently disable a protection.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.login_limit == 0
            || self.rate_limit.password_reset_limit == 0
            || self.rate_limit.mfa_verify_limit == 0
        {
            return Err(Error::Config {
                message: "rate limits must be at least 1".to_string(),
            });
        }
        if self.rate_limit.login_window_secs == 0
            || self.rate_limit.password_reset_window_secs == 0
            || self.rate_limit.mfa_verify_window_secs == 0
        {
            return Err(Error::Config {
                message: "rate limit windows must be non-zero".to_string(),
            });
        }
        if self.lockout.max_failures == 0 || self.lockout.window_minutes <= 0 {
            return Err(Error::Config {
                message: "lockout requires a positive failure count and window".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.risk.step_up_threshold) {
            return Err(Error::Config {
                message: "risk step-up threshold must be within [0, 1]".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.risk.fallback_score) {
            return Err(Error::Config {
                message: "risk fallback score must be within [0, 1]".to_string(),
            });
        }
        if self.risk.day_start_hour >= 24 || self.risk.day_end_hour > 24 {
            return Err(Error::Config {
                message: "normal-hours bounds must be valid UTC hours".to_string(),
            });
        }
        if self.session.lifetime_hours <= 0 {
            return Err(Error::Config {
                message: "session lifetime must be positive".to_string(),
            });
        }
        if self.token.secret.len() < 16 {
            return Err(Error::Config {
                message: "JWT secret must be at least 16 bytes".to_string(),
            });
        }
        if self.token.access_ttl_secs <= 0 || self.token.refresh_ttl_days <= 0 {
            return Err(Error::Config {
                message: "token lifetimes must be positive".to_string(),
            });
        }
        if self.mfa.totp_skew_steps > 2 {
            return Err(Error::Config {
                message: "TOTP skew above 2 steps defeats the point of the codes".to_string(),
            });
        }
        if self.crypto.rsa_bits < 2048 {
            return Err(Error::Config {
                message: "RSA keys below 2048 bits are not accepted".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SecurityConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_limits() {
        let config = SecurityConfig::default();
        assert_eq!(config.rate_limit.login_limit, 5);
        assert_eq!(config.rate_limit.login_window_secs, 300);
        assert_eq!(config.rate_limit.password_reset_limit, 3);
        assert_eq!(config.lockout.max_failures, 5);
        assert_eq!(config.risk.step_up_threshold, 0.6);
        assert_eq!(config.session.lifetime_hours, 24);
        assert_eq!(config.token.access_ttl_secs, 3600);
        assert_eq!(config.token.refresh_ttl_days, 30);
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let mut config = SecurityConfig::default();
        config.rate_limit.login_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_threshold_rejected() {
        let mut config = SecurityConfig::default();
        config.risk.step_up_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_secret_rejected() {
        let mut config = SecurityConfig::default();
        config.token.secret = "short".to_string();
        assert!(config.validate().is_err());
    }
}

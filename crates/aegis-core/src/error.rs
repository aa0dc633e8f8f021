//! Error types for the Aegis security core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Account temporarily locked")]
    AccountLocked,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Multi-factor verification required")]
    MfaRequired,

    #[error("Invalid verification code")]
    InvalidMfaCode,

    #[error("Session expired or revoked")]
    SessionExpiredOrRevoked,

    #[error("Invalid token: {reason}")]
    InvalidToken { reason: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Encryption failure: {message}")]
    EncryptionFailure { message: String },

    #[error("Key not found: {key_id}")]
    KeyNotFound { key_id: String },

    #[error("Store temporarily unavailable: {message}")]
    TransientStore { message: String },
}

impl Error {
    /// Stable machine-readable code for logs and API layers.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE_ERROR",
            Error::Migration(_) => "MIGRATION_ERROR",
            Error::Redis(_) => "CACHE_ERROR",
            Error::Json(_) => "SERIALIZATION_ERROR",
            Error::Config { .. } => "CONFIG_ERROR",
            Error::RateLimited { .. } => "RATE_LIMITED",
            Error::AccountLocked => "ACCOUNT_LOCKED",
            Error::InvalidCredentials => "INVALID_CREDENTIALS",
            Error::MfaRequired => "MFA_REQUIRED",
            Error::InvalidMfaCode => "INVALID_MFA_CODE",
            Error::SessionExpiredOrRevoked => "SESSION_INVALID",
            Error::InvalidToken { .. } => "INVALID_TOKEN",
            Error::PermissionDenied { .. } => "PERMISSION_DENIED",
            Error::EncryptionFailure { .. } => "ENCRYPTION_FAILURE",
            Error::KeyNotFound { .. } => "KEY_NOT_FOUND",
            Error::TransientStore { .. } => "STORE_UNAVAILABLE",
        }
    }

    /// Whether the failure is infrastructure-side and safe to retry or degrade,
    /// as opposed to a terminal authentication/authorization decision.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Migration(_)
                | Error::Redis(_)
                | Error::TransientStore { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

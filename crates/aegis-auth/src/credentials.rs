//! Credential records and the store they live in.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use aegis_core::Result;

/// A user's stored credentials.
///
/// Passwords are held only as Argon2id hashes and backup codes only as
/// SHA-256 digests. The TOTP secret is the one field that must stay
/// recoverable, so `Debug` redacts it along with the password hash.
#[derive(Clone)]
pub struct UserCredential {
    pub user_id: Uuid,
    pub email: String,
    pub password_hash: String,
    /// Base32 TOTP secret, present once MFA setup has begun
    pub mfa_secret: Option<String>,
    pub mfa_enabled: bool,
    /// SHA-256 hex digests of unused backup codes
    pub backup_code_hashes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserCredential {
    pub fn new(email: impl Into<String>, password_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: Uuid::new_v4(),
            email: email.into().to_lowercase(),
            password_hash: password_hash.into(),
            mfa_secret: None,
            mfa_enabled: false,
            backup_code_hashes: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl fmt::Debug for UserCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredential")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("password_hash", &"[REDACTED]")
            .field("mfa_secret", &self.mfa_secret.as_ref().map(|_| "[REDACTED]"))
            .field("mfa_enabled", &self.mfa_enabled)
            .field("backup_codes", &self.backup_code_hashes.len())
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Storage backend for credential records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserCredential>>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserCredential>>;

    async fn insert(&self, credential: &UserCredential) -> Result<()>;

    /// Replace the password hash. Returns false if the user does not exist.
    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<bool>;

    /// Set or clear the TOTP secret and the enabled flag together.
    async fn set_mfa(&self, user_id: Uuid, secret: Option<&str>, enabled: bool) -> Result<bool>;

    /// Replace the full set of backup code hashes.
    async fn set_backup_codes(&self, user_id: Uuid, code_hashes: &[String]) -> Result<bool>;

    /// Remove one backup code hash if present. Returns true only when the
    /// hash was there, which makes each code single-use.
    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool>;
}

/// In-memory credential store for tests and development.
pub struct MemoryCredentialStore {
    users: Arc<RwLock<HashMap<Uuid, UserCredential>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserCredential>> {
        let email = email.to_lowercase();
        let users = self.users.read().await;
        Ok(users.values().find(|c| c.email == email).cloned())
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserCredential>> {
        let users = self.users.read().await;
        Ok(users.get(&user_id).cloned())
    }

    async fn insert(&self, credential: &UserCredential) -> Result<()> {
        let mut users = self.users.write().await;
        users.insert(credential.user_id, credential.clone());
        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(credential) => {
                credential.password_hash = password_hash.to_string();
                credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_mfa(&self, user_id: Uuid, secret: Option<&str>, enabled: bool) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(credential) => {
                credential.mfa_secret = secret.map(|s| s.to_string());
                credential.mfa_enabled = enabled;
                credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_backup_codes(&self, user_id: Uuid, code_hashes: &[String]) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(credential) => {
                credential.backup_code_hashes = code_hashes.to_vec();
                credential.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool> {
        let mut users = self.users.write().await;
        match users.get_mut(&user_id) {
            Some(credential) => {
                let before = credential.backup_code_hashes.len();
                credential.backup_code_hashes.retain(|h| h != code_hash);
                let consumed = credential.backup_code_hashes.len() < before;
                if consumed {
                    credential.updated_at = Utc::now();
                }
                Ok(consumed)
            }
            None => Ok(false),
        }
    }
}

//! Key lifecycle management.
//!
//! Keys are generated per purpose, rotated by creating a successor under a new
//! id, and retired explicitly. Rotated and retired keys keep decrypting forever;
//! only the active key of a purpose accepts new encryption. Key material is
//! stored encrypted under a master key held in a file with owner-only
//! permissions, and is never logged.

use crate::cipher::{self, CipherMethod, EncryptedBundle};
use aegis_core::config::CryptoConfig;
use aegis_core::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// What a key is for; determines its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum KeyPurpose {
    /// Default symmetric key for AES and fernet-style methods.
    Symmetric,
    /// Default RSA pair for asymmetric and hybrid methods.
    Asymmetric,
    /// Named symmetric key scoped to one feature.
    Feature(String),
}

impl KeyPurpose {
    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeyPurpose::Asymmetric => KeyAlgorithm::Rsa,
            KeyPurpose::Symmetric | KeyPurpose::Feature(_) => KeyAlgorithm::Aes256,
        }
    }

    /// Stable storage form: `symmetric`, `asymmetric`, or `feature:<name>`.
    pub fn as_storage_str(&self) -> String {
        match self {
            KeyPurpose::Symmetric => "symmetric".to_string(),
            KeyPurpose::Asymmetric => "asymmetric".to_string(),
            KeyPurpose::Feature(name) => format!("feature:{}", name),
        }
    }

    pub fn from_storage_str(raw: &str) -> Self {
        match raw {
            "symmetric" => KeyPurpose::Symmetric,
            "asymmetric" => KeyPurpose::Asymmetric,
            other => KeyPurpose::Feature(
                other.strip_prefix("feature:").unwrap_or(other).to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Aes256,
    Rsa,
}

/// Lifecycle state; encryption requires `Active`, decryption works in any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Active,
    /// Superseded by a rotation; kept for decryption.
    Rotated,
    /// Explicitly ended; kept for decryption.
    Retired,
}

impl KeyState {
    pub fn can_encrypt(&self) -> bool {
        matches!(self, KeyState::Active)
    }
}

/// Persisted key record. `material` is ciphertext under the master key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub key_id: String,
    pub purpose: KeyPurpose,
    pub algorithm: KeyAlgorithm,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub material: Vec<u8>,
}

/// Key listing entry; carries everything except material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    pub key_id: String,
    pub purpose: KeyPurpose,
    pub algorithm: KeyAlgorithm,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&StoredKey> for KeyMetadata {
    fn from(key: &StoredKey) -> Self {
        Self {
            key_id: key.key_id.clone(),
            purpose: key.purpose.clone(),
            algorithm: key.algorithm,
            state: key.state,
            created_at: key.created_at,
            expires_at: key.expires_at,
        }
    }
}

/// Durable storage for key records.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn insert(&self, key: StoredKey) -> Result<()>;

    async fn get(&self, key_id: &str) -> Result<Option<StoredKey>>;

    /// Most recently created `Active` key for a purpose.
    async fn active_for(&self, purpose: &KeyPurpose) -> Result<Option<StoredKey>>;

    async fn set_state(&self, key_id: &str, state: KeyState) -> Result<bool>;

    async fn list(&self) -> Result<Vec<KeyMetadata>>;
}

/// In-memory key store for tests and single-node development.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, StoredKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn insert(&self, key: StoredKey) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.insert(key.key_id.clone(), key);
        Ok(())
    }

    async fn get(&self, key_id: &str) -> Result<Option<StoredKey>> {
        let keys = self.keys.read().await;
        Ok(keys.get(key_id).cloned())
    }

    async fn active_for(&self, purpose: &KeyPurpose) -> Result<Option<StoredKey>> {
        let keys = self.keys.read().await;
        Ok(keys
            .values()
            .filter(|k| k.purpose == *purpose && k.state == KeyState::Active)
            .max_by_key(|k| k.created_at)
            .cloned())
    }

    async fn set_state(&self, key_id: &str, state: KeyState) -> Result<bool> {
        let mut keys = self.keys.write().await;
        match keys.get_mut(key_id) {
            Some(key) => {
                key.state = state;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<KeyMetadata>> {
        let keys = self.keys.read().await;
        let mut out: Vec<KeyMetadata> = keys.values().map(KeyMetadata::from).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }
}

/// Load the master key from `path`, creating it with owner-only permissions if
/// absent. The file holds 32 hex-encoded random bytes.
pub async fn load_or_create_master_key(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        let content =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::Config {
                    message: format!("Cannot read master key file: {}", e),
                })?;
        let key = hex::decode(content.trim()).map_err(|_| Error::Config {
            message: "Master key file is not valid hex".to_string(),
        })?;
        if key.len() != 32 {
            return Err(Error::Config {
                message: "Master key must be 32 bytes".to_string(),
            });
        }
        return Ok(key);
    }

    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);

    tokio::fs::write(path, hex::encode(key))
        .await
        .map_err(|e| Error::Config {
            message: format!("Cannot write master key file: {}", e),
        })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Config {
                message: format!("Cannot restrict master key permissions: {}", e),
            })?;
    }

    info!(path = %path.display(), "Created master key file");
    Ok(key.to_vec())
}

/// Generates, rotates, and retires keys and runs every encrypt/decrypt through
/// them.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    master_key: Vec<u8>,
    config: CryptoConfig,
}

impl KeyManager {
    /// Build a manager and make sure the default symmetric and asymmetric keys
    /// exist.
    pub async fn new(store: Arc<dyn KeyStore>, config: CryptoConfig) -> Result<Self> {
        let master_key = load_or_create_master_key(Path::new(&config.master_key_path)).await?;
        let manager = Self {
            store,
            master_key,
            config,
        };

        if manager
            .store
            .active_for(&KeyPurpose::Symmetric)
            .await?
            .is_none()
        {
            manager.generate_key(KeyPurpose::Symmetric).await?;
        }
        if manager
            .store
            .active_for(&KeyPurpose::Asymmetric)
            .await?
            .is_none()
        {
            manager.generate_key(KeyPurpose::Asymmetric).await?;
        }

        Ok(manager)
    }

    /// Generate and store a new active key for a purpose.
    pub async fn generate_key(&self, purpose: KeyPurpose) -> Result<KeyMetadata> {
        let material = match purpose.algorithm() {
            KeyAlgorithm::Aes256 => {
                let mut key = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut key);
                key.to_vec()
            }
            KeyAlgorithm::Rsa => {
                // Modulus generation is CPU-bound; keep it off the async workers.
                let bits = self.config.rsa_bits;
                tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits).map_err(|e| {
                        Error::EncryptionFailure {
                            message: format!("RSA key generation failed: {}", e),
                        }
                    })?;
                    Ok(key
                        .to_pkcs8_der()
                        .map_err(|e| Error::EncryptionFailure {
                            message: format!("RSA key encoding failed: {}", e),
                        })?
                        .as_bytes()
                        .to_vec())
                })
                .await
                .map_err(|e| Error::EncryptionFailure {
                    message: format!("Key generation task failed: {}", e),
                })??
            }
        };

        let record = StoredKey {
            key_id: Uuid::new_v4().to_string(),
            algorithm: purpose.algorithm(),
            purpose,
            state: KeyState::Active,
            created_at: Utc::now(),
            expires_at: None,
            material: cipher::encrypt_aes_gcm(&self.master_key, &material)?,
        };
        let metadata = KeyMetadata::from(&record);

        self.store.insert(record).await?;
        info!(
            key_id = %metadata.key_id,
            purpose = %metadata.purpose.as_storage_str(),
            "Generated encryption key"
        );
        Ok(metadata)
    }

    /// Replace the active key of a purpose; the old key moves to `Rotated` and
    /// keeps decrypting.
    pub async fn rotate(&self, purpose: KeyPurpose) -> Result<KeyMetadata> {
        let previous = self.store.active_for(&purpose).await?;
        let fresh = self.generate_key(purpose).await?;

        if let Some(previous) = previous {
            self.store
                .set_state(&previous.key_id, KeyState::Rotated)
                .await?;
            info!(
                old_key_id = %previous.key_id,
                new_key_id = %fresh.key_id,
                "Rotated encryption key"
            );
        }
        Ok(fresh)
    }

    /// Explicitly end a key. It refuses new encryption but never stops
    /// decrypting data already protected by it.
    pub async fn retire(&self, key_id: &str) -> Result<()> {
        if !self.store.set_state(key_id, KeyState::Retired).await? {
            return Err(Error::KeyNotFound {
                key_id: key_id.to_string(),
            });
        }
        info!(key_id = %key_id, "Retired encryption key");
        Ok(())
    }

    /// Key inventory; metadata only, material never leaves the store.
    pub async fn list_keys(&self) -> Result<Vec<KeyMetadata>> {
        self.store.list().await
    }

    /// Encrypt under the named key, or the active default for the method's
    /// family when no id is given.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        method: CipherMethod,
        key_id: Option<&str>,
    ) -> Result<EncryptedBundle> {
        let record = match key_id {
            Some(id) => self.store.get(id).await?.ok_or_else(|| Error::KeyNotFound {
                key_id: id.to_string(),
            })?,
            None => {
                let purpose = if method.is_asymmetric() {
                    KeyPurpose::Asymmetric
                } else {
                    KeyPurpose::Symmetric
                };
                self.store
                    .active_for(&purpose)
                    .await?
                    .ok_or_else(|| Error::KeyNotFound {
                        key_id: purpose.as_storage_str(),
                    })?
            }
        };

        if !record.state.can_encrypt() {
            warn!(key_id = %record.key_id, security = true, "Encryption refused with inactive key");
            return Err(Error::EncryptionFailure {
                message: format!("Key {} is not active for encryption", record.key_id),
            });
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= Utc::now() {
                return Err(Error::EncryptionFailure {
                    message: format!("Key {} has expired", record.key_id),
                });
            }
        }
        self.check_family(&record, method)?;

        let material = self.unseal(&record)?;
        let standard = base64::engine::general_purpose::STANDARD;

        let (ciphertext, iv, tag) = match method {
            CipherMethod::Fernet => (cipher::fernet_encrypt(&material, plaintext)?, None, None),
            CipherMethod::AesGcm => (
                standard.encode(cipher::encrypt_aes_gcm(&material, plaintext)?),
                None,
                None,
            ),
            CipherMethod::AesCbc => {
                let (ciphertext, iv, tag) = cipher::encrypt_aes_cbc(&material, plaintext)?;
                (
                    standard.encode(ciphertext),
                    Some(standard.encode(iv)),
                    Some(standard.encode(tag)),
                )
            }
            CipherMethod::Rsa => (
                standard.encode(cipher::encrypt_rsa(&material, plaintext)?),
                None,
                None,
            ),
            CipherMethod::Hybrid => (
                standard.encode(cipher::encrypt_hybrid(&material, plaintext)?),
                None,
                None,
            ),
        };

        Ok(EncryptedBundle {
            ciphertext,
            method,
            key_id: record.key_id,
            iv,
            tag,
        })
    }

    /// Decrypt a bundle with whatever key it names, in any lifecycle state.
    pub async fn decrypt(&self, bundle: &EncryptedBundle) -> Result<Vec<u8>> {
        let record = self
            .store
            .get(&bundle.key_id)
            .await?
            .ok_or_else(|| Error::KeyNotFound {
                key_id: bundle.key_id.clone(),
            })?;
        self.check_family(&record, bundle.method)?;

        let material = self.unseal(&record)?;
        let standard = base64::engine::general_purpose::STANDARD;
        let decode = |raw: &str| {
            standard.decode(raw).map_err(|_| Error::EncryptionFailure {
                message: "Bundle payload is not valid base64".to_string(),
            })
        };

        match bundle.method {
            CipherMethod::Fernet => cipher::fernet_decrypt(&material, &bundle.ciphertext),
            CipherMethod::AesGcm => cipher::decrypt_aes_gcm(&material, &decode(&bundle.ciphertext)?),
            CipherMethod::AesCbc => {
                let iv = bundle.iv.as_deref().ok_or_else(|| Error::EncryptionFailure {
                    message: "CBC bundle is missing its IV".to_string(),
                })?;
                let tag = bundle
                    .tag
                    .as_deref()
                    .ok_or_else(|| Error::EncryptionFailure {
                        message: "CBC bundle is missing its tag".to_string(),
                    })?;
                cipher::decrypt_aes_cbc(
                    &material,
                    &decode(&bundle.ciphertext)?,
                    &decode(iv)?,
                    &decode(tag)?,
                )
            }
            CipherMethod::Rsa => cipher::decrypt_rsa(&material, &decode(&bundle.ciphertext)?),
            CipherMethod::Hybrid => cipher::decrypt_hybrid(&material, &decode(&bundle.ciphertext)?),
        }
    }

    fn check_family(&self, record: &StoredKey, method: CipherMethod) -> Result<()> {
        let matches = match record.algorithm {
            KeyAlgorithm::Aes256 => !method.is_asymmetric(),
            KeyAlgorithm::Rsa => method.is_asymmetric(),
        };
        if !matches {
            return Err(Error::EncryptionFailure {
                message: format!(
                    "Key {} does not support the requested method",
                    record.key_id
                ),
            });
        }
        Ok(())
    }

    fn unseal(&self, record: &StoredKey) -> Result<Vec<u8>> {
        cipher::decrypt_aes_gcm(&self.master_key, &record.material)
    }
}

//! TOTP enrollment, login challenges, and backup codes.
//!
//! Pending state never touches the durable store: unconfirmed setup secrets
//! and open challenges live in the cache under their own TTLs, so abandoned
//! flows clean themselves up. A challenge handle dies on success, on too
//! many wrong codes, or when its TTL fires, whichever comes first.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};
use uuid::Uuid;

use aegis_core::cache::{get_json, set_json};
use aegis_core::config::MfaConfig;
use aegis_core::{Cache, Error, Result};

use crate::credentials::{CredentialStore, UserCredential};

/// Enrollment material handed to the user exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaSetup {
    pub secret_base32: String,
    pub provisioning_uri: String,
    pub qr_png_base64: String,
}

/// Proof that a challenge was answered correctly.
#[derive(Debug, Clone)]
pub struct VerifiedChallenge {
    pub user_id: Uuid,
    pub device_fingerprint: String,
    pub origin_address: String,
    pub used_backup_code: bool,
}

/// Cache-resident state of one open challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChallengeState {
    user_id: Uuid,
    device_fingerprint: String,
    origin_address: String,
    failures: u32,
    created_at: DateTime<Utc>,
}

fn setup_key(user_id: Uuid) -> String {
    format!("mfa:setup:{}", user_id)
}

fn challenge_key(handle: &str) -> String {
    format!("mfa:challenge:{}", handle)
}

fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn generate_handle() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn generate_backup_code() -> String {
    let bytes: [u8; 5] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Runs MFA enrollment and challenge verification.
pub struct MfaCoordinator {
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<dyn Cache>,
    config: MfaConfig,
}

impl MfaCoordinator {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        cache: Arc<dyn Cache>,
        config: MfaConfig,
    ) -> Self {
        Self {
            credentials,
            cache,
            config,
        }
    }

    fn build_totp(&self, secret_base32: &str, account_name: &str) -> Result<TOTP> {
        let secret = Secret::Encoded(secret_base32.to_string());
        let bytes = secret.to_bytes().map_err(|e| Error::EncryptionFailure {
            message: format!("malformed TOTP secret: {}", e),
        })?;
        TOTP::new(
            Algorithm::SHA1,
            6,
            self.config.totp_skew_steps,
            30,
            bytes,
            Some(self.config.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|e| Error::EncryptionFailure {
            message: format!("TOTP construction failed: {}", e),
        })
    }

    async fn load_credential(&self, user_id: Uuid) -> Result<UserCredential> {
        self.credentials
            .find_by_id(user_id)
            .await?
            .ok_or(Error::InvalidCredentials)
    }

    /// Start TOTP enrollment. The secret stays pending in the cache until
    /// [`confirm_setup`](Self::confirm_setup) proves the user's app has it.
    pub async fn begin_setup(&self, user_id: Uuid) -> Result<MfaSetup> {
        let credential = self.load_credential(user_id).await?;
        if credential.mfa_enabled {
            return Err(Error::PermissionDenied {
                reason: "MFA is already enabled".to_string(),
            });
        }

        let secret = Secret::generate_secret();
        let secret_base32 = secret.to_encoded().to_string();
        let totp = self.build_totp(&secret_base32, &credential.email)?;

        let qr_png_base64 = totp.get_qr_base64().map_err(|e| Error::EncryptionFailure {
            message: format!("QR rendering failed: {}", e),
        })?;

        self.cache
            .set(
                &setup_key(user_id),
                &secret_base32,
                Some(StdDuration::from_secs(self.config.pending_setup_ttl_secs)),
            )
            .await?;

        info!(security = true, user_id = %user_id, "MFA setup started");
        Ok(MfaSetup {
            provisioning_uri: totp.get_url(),
            secret_base32,
            qr_png_base64,
        })
    }

    /// Complete enrollment by proving possession of the pending secret.
    /// Returns the plaintext backup codes, shown exactly once.
    pub async fn confirm_setup(&self, user_id: Uuid, code: &str) -> Result<Vec<String>> {
        let pending = match self.cache.get(&setup_key(user_id)).await? {
            Some(secret) => secret,
            // Setup never started or already timed out
            None => return Err(Error::InvalidMfaCode),
        };

        let credential = self.load_credential(user_id).await?;
        let totp = self.build_totp(&pending, &credential.email)?;
        let valid = totp.check_current(code).map_err(|e| Error::EncryptionFailure {
            message: format!("system clock error: {}", e),
        })?;
        if !valid {
            return Err(Error::InvalidMfaCode);
        }

        let codes: Vec<String> = (0..self.config.backup_code_count)
            .map(|_| generate_backup_code())
            .collect();
        let hashes: Vec<String> = codes.iter().map(|c| hash_code(c)).collect();

        self.credentials
            .set_mfa(user_id, Some(&pending), true)
            .await?;
        self.credentials.set_backup_codes(user_id, &hashes).await?;
        self.cache.delete(&setup_key(user_id)).await?;

        info!(security = true, user_id = %user_id, "MFA enabled");
        Ok(codes)
    }

    /// Open a challenge and return its handle. The handle is the only way
    /// to finish the login, and it expires on its own.
    pub async fn begin_challenge(
        &self,
        user_id: Uuid,
        device_fingerprint: &str,
        origin_address: &str,
    ) -> Result<String> {
        let handle = generate_handle();
        let state = ChallengeState {
            user_id,
            device_fingerprint: device_fingerprint.to_string(),
            origin_address: origin_address.to_string(),
            failures: 0,
            created_at: Utc::now(),
        };

        set_json(
            self.cache.as_ref(),
            &challenge_key(&handle),
            &state,
            Some(StdDuration::from_secs(self.config.challenge_ttl_secs)),
        )
        .await?;

        info!(
            security = true,
            user_id = %user_id,
            handle_prefix = %&handle[..8],
            "MFA challenge issued"
        );
        Ok(handle)
    }

    /// Check a TOTP or backup code against an open challenge.
    ///
    /// Wrong answers are counted in the challenge itself; once the budget
    /// is spent the handle is destroyed and the login must start over. The
    /// caller learns nothing beyond "invalid code", including whether the
    /// handle exists at all.
    pub async fn verify_code(
        &self,
        user_id: Uuid,
        handle: &str,
        code: &str,
    ) -> Result<VerifiedChallenge> {
        let key = challenge_key(handle);
        let mut state: ChallengeState = match get_json(self.cache.as_ref(), &key).await? {
            Some(state) => state,
            None => return Err(Error::InvalidMfaCode),
        };

        if state.user_id != user_id {
            warn!(
                security = true,
                user_id = %user_id,
                handle_prefix = %&handle[..handle.len().min(8)],
                "MFA challenge ownership mismatch"
            );
            return Err(Error::InvalidMfaCode);
        }

        let credential = self.load_credential(user_id).await?;
        match self.check_factor(&credential, code).await? {
            Some(used_backup_code) => {
                self.cache.delete(&key).await?;
                info!(
                    security = true,
                    user_id = %user_id,
                    used_backup_code = used_backup_code,
                    "MFA challenge passed"
                );
                Ok(VerifiedChallenge {
                    user_id,
                    device_fingerprint: state.device_fingerprint,
                    origin_address: state.origin_address,
                    used_backup_code,
                })
            }
            None => {
                state.failures += 1;
                if state.failures >= self.config.max_challenge_failures {
                    self.cache.delete(&key).await?;
                    warn!(
                        security = true,
                        user_id = %user_id,
                        failures = state.failures,
                        "MFA challenge exhausted"
                    );
                } else {
                    // Keep the original deadline; failures must not extend it
                    let elapsed = (Utc::now() - state.created_at).num_seconds().max(0) as u64;
                    let remaining = self.config.challenge_ttl_secs.saturating_sub(elapsed);
                    if remaining == 0 {
                        self.cache.delete(&key).await?;
                    } else {
                        set_json(
                            self.cache.as_ref(),
                            &key,
                            &state,
                            Some(StdDuration::from_secs(remaining)),
                        )
                        .await?;
                    }
                }
                Err(Error::InvalidMfaCode)
            }
        }
    }

    /// Turn MFA off again. Requires a currently valid code so a stolen
    /// session alone cannot strip the second factor.
    pub async fn disable_mfa(&self, user_id: Uuid, code: &str) -> Result<()> {
        let credential = self.load_credential(user_id).await?;
        if !credential.mfa_enabled {
            return Err(Error::PermissionDenied {
                reason: "MFA is not enabled".to_string(),
            });
        }

        if self.check_factor(&credential, code).await?.is_none() {
            return Err(Error::InvalidMfaCode);
        }

        self.credentials.set_mfa(user_id, None, false).await?;
        self.credentials.set_backup_codes(user_id, &[]).await?;

        info!(security = true, user_id = %user_id, "MFA disabled");
        Ok(())
    }

    /// Replace every backup code. The old set stops working immediately.
    pub async fn regenerate_backup_codes(&self, user_id: Uuid, code: &str) -> Result<Vec<String>> {
        let credential = self.load_credential(user_id).await?;
        if !credential.mfa_enabled {
            return Err(Error::PermissionDenied {
                reason: "MFA is not enabled".to_string(),
            });
        }

        if self.check_factor(&credential, code).await?.is_none() {
            return Err(Error::InvalidMfaCode);
        }

        let codes: Vec<String> = (0..self.config.backup_code_count)
            .map(|_| generate_backup_code())
            .collect();
        let hashes: Vec<String> = codes.iter().map(|c| hash_code(c)).collect();
        self.credentials.set_backup_codes(user_id, &hashes).await?;

        info!(security = true, user_id = %user_id, "Backup codes regenerated");
        Ok(codes)
    }

    /// Try the TOTP first, then the backup codes. A matching backup code is
    /// consumed even when checked outside a login challenge.
    async fn check_factor(
        &self,
        credential: &UserCredential,
        code: &str,
    ) -> Result<Option<bool>> {
        if credential.mfa_enabled {
            if let Some(secret) = &credential.mfa_secret {
                let totp = self.build_totp(secret, &credential.email)?;
                let valid = totp.check_current(code).map_err(|e| Error::EncryptionFailure {
                    message: format!("system clock error: {}", e),
                })?;
                if valid {
                    return Ok(Some(false));
                }
            }
        }

        if !credential.backup_code_hashes.is_empty()
            && self
                .credentials
                .consume_backup_code(credential.user_id, &hash_code(code))
                .await?
        {
            return Ok(Some(true));
        }

        Ok(None)
    }
}

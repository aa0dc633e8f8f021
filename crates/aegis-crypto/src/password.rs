//! Password hashing with Argon2id.
//!
//! Verification is a boolean outcome; the only hard error is a stored hash that
//! cannot be parsed. The cost parameters come from [`CryptoConfig`] so they can
//! be tuned without touching call sites.

use aegis_core::config::CryptoConfig;
use aegis_core::{Error, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString,
};
use argon2::{Algorithm, Argon2, Params, Version};

pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new(config: &CryptoConfig) -> Result<Self> {
        let params = Params::new(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
            None,
        )
        .map_err(|e| Error::Config {
            message: format!("Invalid Argon2 parameters: {}", e),
        })?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    /// Hash a plaintext password with a fresh random salt.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| Error::EncryptionFailure {
                message: format!("Failed to hash password: {}", e),
            })
    }

    /// Verify a plaintext password against a stored hash.
    ///
    /// A wrong password is `Ok(false)`; only a malformed stored hash is an error.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash).map_err(|e| Error::EncryptionFailure {
            message: format!("Stored password hash is malformed: {}", e),
        })?;

        Ok(self
            .argon2
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok())
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
        }
    }
}

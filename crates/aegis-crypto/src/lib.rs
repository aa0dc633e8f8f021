//! Aegis Crypto Library
//!
//! Password hashing, the multi-method cipher suite, and key lifecycle
//! management. Methods cover fernet-style tokens, AES-256-GCM, AES-256-CBC with
//! an HMAC tag, RSA-OAEP for small payloads, and hybrid RSA-wrapped AES for
//! everything else. Keys rotate without breaking old ciphertext.

pub mod cipher;
pub mod key_store_pg;
pub mod keyring;
pub mod password;

pub use cipher::{CipherMethod, EncryptedBundle};
pub use key_store_pg::PostgresKeyStore;
pub use keyring::{
    KeyAlgorithm, KeyManager, KeyMetadata, KeyPurpose, KeyState, KeyStore, MemoryKeyStore,
};
pub use password::PasswordHasher;

//! Cipher primitives for every supported encryption method.
//!
//! Each function operates on raw key bytes; key resolution and lifecycle live in
//! the key manager. Layouts:
//! - AES-256-GCM: 12-byte random nonce prepended to the ciphertext (tag folded in).
//! - AES-256-CBC: PKCS7 padding, random 16-byte IV, encrypt-then-MAC with
//!   HMAC-SHA256 over (iv || ciphertext).
//! - Fernet-style token: `0x80 || timestamp(8 BE) || iv(16) || AES-128-CBC body ||
//!   HMAC-SHA256(32)`, URL-safe base64. Signing key is the first 16 key bytes,
//!   encryption key the last 16.
//! - RSA-OAEP-SHA256: payloads up to 190 bytes for a 2048-bit modulus.
//! - Hybrid: fresh AES-256-GCM data key, RSA-wrapped, framed as
//!   `wrapped_len(4 BE) || wrapped_key || gcm_payload`.

use aegis_core::{Error, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// AES-GCM nonce size (96 bits / 12 bytes as recommended).
pub const NONCE_SIZE: usize = 12;
/// CBC initialization vector size.
pub const CBC_IV_SIZE: usize = 16;
/// HMAC-SHA256 tag size.
pub const MAC_SIZE: usize = 32;
/// Fernet token version byte.
const FERNET_VERSION: u8 = 0x80;
/// OAEP-SHA256 capacity of a 2048-bit modulus.
pub const RSA_MAX_PAYLOAD: usize = 190;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// Supported encryption methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherMethod {
    /// Fernet-style authenticated token (AES-128-CBC + HMAC-SHA256).
    Fernet,
    /// AES-256-GCM authenticated encryption.
    AesGcm,
    /// AES-256-CBC with PKCS7 padding and an HMAC-SHA256 tag.
    AesCbc,
    /// RSA-OAEP-SHA256, small payloads only.
    Rsa,
    /// RSA-wrapped AES-256-GCM data key, arbitrary payload size.
    Hybrid,
}

impl CipherMethod {
    /// Whether the method needs an asymmetric key pair.
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, CipherMethod::Rsa | CipherMethod::Hybrid)
    }
}

/// Self-describing encryption result; everything needed to decrypt except the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBundle {
    /// Base64 payload; layout depends on the method.
    pub ciphertext: String,
    pub method: CipherMethod,
    /// Id of the key the payload was encrypted under.
    pub key_id: String,
    /// CBC initialization vector, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    /// CBC authentication tag, base64.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

fn encryption_error(message: impl Into<String>) -> Error {
    Error::EncryptionFailure {
        message: message.into(),
    }
}

// Domain-separated subkeys so one stored key drives both CBC encryption and
// authentication.
fn derive_subkey(key: &[u8], label: &[u8]) -> [u8; 32] {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(key);
    hasher.update(label);
    let digest = hasher.finalize();
    let mut subkey = [0u8; 32];
    subkey.copy_from_slice(&digest);
    subkey
}

/// Encrypt with AES-256-GCM; the random nonce is prepended to the ciphertext.
pub fn encrypt_aes_gcm(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| encryption_error(format!("Failed to create AES-GCM cipher: {}", e)))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| encryption_error(format!("AES-GCM encryption failed: {}", e)))?;

    // Prepend nonce to ciphertext for storage
    let mut combined = nonce.to_vec();
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

/// Decrypt AES-256-GCM data produced by [`encrypt_aes_gcm`].
pub fn decrypt_aes_gcm(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(encryption_error("Encrypted data too short"));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| encryption_error(format!("Failed to create AES-GCM cipher: {}", e)))?;
    let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);

    cipher
        .decrypt(nonce, &data[NONCE_SIZE..])
        .map_err(|_| encryption_error("AES-GCM decryption failed (wrong key or corrupted data)"))
}

/// Encrypt with AES-256-CBC and authenticate with HMAC-SHA256.
///
/// Returns `(ciphertext, iv, tag)`; the tag covers `iv || ciphertext`.
pub fn encrypt_aes_cbc(key: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
    let enc_key = derive_subkey(key, b"enc");
    let mac_key = derive_subkey(key, b"mac");

    let mut iv = [0u8; CBC_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let ciphertext = Aes256CbcEnc::new_from_slices(&enc_key, &iv)
        .map_err(|e| encryption_error(format!("Failed to create AES-CBC cipher: {}", e)))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
        .map_err(|e| encryption_error(format!("Failed to create HMAC: {}", e)))?;
    mac.update(&iv);
    mac.update(&ciphertext);
    let tag = mac.finalize().into_bytes().to_vec();

    Ok((ciphertext, iv.to_vec(), tag))
}

/// Verify the tag and decrypt AES-256-CBC data produced by [`encrypt_aes_cbc`].
pub fn decrypt_aes_cbc(key: &[u8], ciphertext: &[u8], iv: &[u8], tag: &[u8]) -> Result<Vec<u8>> {
    let enc_key = derive_subkey(key, b"enc");
    let mac_key = derive_subkey(key, b"mac");

    // Authenticate before touching the ciphertext.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(&mac_key)
        .map_err(|e| encryption_error(format!("Failed to create HMAC: {}", e)))?;
    mac.update(iv);
    mac.update(ciphertext);
    mac.verify_slice(tag)
        .map_err(|_| encryption_error("AES-CBC authentication failed"))?;

    Aes256CbcDec::new_from_slices(&enc_key, iv)
        .map_err(|e| encryption_error(format!("Failed to create AES-CBC cipher: {}", e)))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| encryption_error("AES-CBC decryption failed (bad padding)"))
}

/// Produce a fernet-style authenticated token from a 32-byte key.
pub fn fernet_encrypt(key: &[u8], plaintext: &[u8]) -> Result<String> {
    use base64::Engine;

    if key.len() != 32 {
        return Err(encryption_error("Fernet keys must be 32 bytes"));
    }
    let (signing_key, enc_key) = key.split_at(16);

    let mut iv = [0u8; CBC_IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let body = Aes128CbcEnc::new_from_slices(enc_key, &iv)
        .map_err(|e| encryption_error(format!("Failed to create token cipher: {}", e)))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let timestamp = Utc::now().timestamp().max(0) as u64;
    let mut token = Vec::with_capacity(1 + 8 + CBC_IV_SIZE + body.len() + MAC_SIZE);
    token.push(FERNET_VERSION);
    token.extend_from_slice(&timestamp.to_be_bytes());
    token.extend_from_slice(&iv);
    token.extend_from_slice(&body);

    let mut mac = <HmacSha256 as Mac>::new_from_slice(signing_key)
        .map_err(|e| encryption_error(format!("Failed to create HMAC: {}", e)))?;
    mac.update(&token);
    token.extend_from_slice(&mac.finalize().into_bytes());

    Ok(base64::engine::general_purpose::URL_SAFE.encode(&token))
}

/// Verify and decrypt a fernet-style token.
pub fn fernet_decrypt(key: &[u8], token: &str) -> Result<Vec<u8>> {
    use base64::Engine;

    if key.len() != 32 {
        return Err(encryption_error("Fernet keys must be 32 bytes"));
    }
    let (signing_key, enc_key) = key.split_at(16);

    let raw = base64::engine::general_purpose::URL_SAFE
        .decode(token)
        .map_err(|_| encryption_error("Token is not valid base64"))?;

    // version + timestamp + iv + at least one block + tag
    if raw.len() < 1 + 8 + CBC_IV_SIZE + 16 + MAC_SIZE {
        return Err(encryption_error("Token too short"));
    }
    if raw[0] != FERNET_VERSION {
        return Err(encryption_error("Unsupported token version"));
    }

    let (signed, tag) = raw.split_at(raw.len() - MAC_SIZE);
    let mut mac = <HmacSha256 as Mac>::new_from_slice(signing_key)
        .map_err(|e| encryption_error(format!("Failed to create HMAC: {}", e)))?;
    mac.update(signed);
    mac.verify_slice(tag)
        .map_err(|_| encryption_error("Token authentication failed"))?;

    let iv = &signed[9..9 + CBC_IV_SIZE];
    let body = &signed[9 + CBC_IV_SIZE..];
    Aes128CbcDec::new_from_slices(enc_key, iv)
        .map_err(|e| encryption_error(format!("Failed to create token cipher: {}", e)))?
        .decrypt_padded_vec_mut::<Pkcs7>(body)
        .map_err(|_| encryption_error("Token decryption failed"))
}

fn private_key_from_der(der: &[u8]) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs8_der(der)
        .map_err(|_| encryption_error("Stored RSA key material is malformed"))
}

/// Encrypt a small payload with RSA-OAEP-SHA256 under the pair's public key.
pub fn encrypt_rsa(private_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() > RSA_MAX_PAYLOAD {
        return Err(encryption_error(format!(
            "RSA payloads are limited to {} bytes; got {}. Use the hybrid method instead",
            RSA_MAX_PAYLOAD,
            plaintext.len()
        )));
    }

    let private_key = private_key_from_der(private_der)?;
    let public_key = RsaPublicKey::from(&private_key);
    public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<rsa::sha2::Sha256>(), plaintext)
        .map_err(|e| encryption_error(format!("RSA encryption failed: {}", e)))
}

/// Decrypt RSA-OAEP-SHA256 data.
pub fn decrypt_rsa(private_der: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let private_key = private_key_from_der(private_der)?;
    private_key
        .decrypt(Oaep::new::<rsa::sha2::Sha256>(), ciphertext)
        .map_err(|_| encryption_error("RSA decryption failed (wrong key or corrupted data)"))
}

/// Hybrid encryption: a fresh AES-256-GCM data key protects the payload, RSA
/// protects the data key. Output: `wrapped_len(4 BE) || wrapped_key || payload`.
pub fn encrypt_hybrid(private_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut data_key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut data_key);

    let payload = encrypt_aes_gcm(&data_key, plaintext)?;

    let private_key = private_key_from_der(private_der)?;
    let public_key = RsaPublicKey::from(&private_key);
    let wrapped = public_key
        .encrypt(&mut rand::thread_rng(), Oaep::new::<rsa::sha2::Sha256>(), &data_key)
        .map_err(|e| encryption_error(format!("Failed to wrap data key: {}", e)))?;

    let mut combined = Vec::with_capacity(4 + wrapped.len() + payload.len());
    combined.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
    combined.extend_from_slice(&wrapped);
    combined.extend_from_slice(&payload);
    Ok(combined)
}

/// Decrypt data produced by [`encrypt_hybrid`].
pub fn decrypt_hybrid(private_der: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(encryption_error("Hybrid payload too short"));
    }

    let wrapped_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() < 4 + wrapped_len {
        return Err(encryption_error("Hybrid payload truncated"));
    }

    let wrapped = &data[4..4 + wrapped_len];
    let payload = &data[4 + wrapped_len..];

    let private_key = private_key_from_der(private_der)?;
    let data_key = private_key
        .decrypt(Oaep::new::<rsa::sha2::Sha256>(), wrapped)
        .map_err(|_| encryption_error("Failed to unwrap data key"))?;

    decrypt_aes_gcm(&data_key, payload)
}

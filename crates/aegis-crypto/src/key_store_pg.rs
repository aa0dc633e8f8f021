//! PostgreSQL storage backend for encryption keys.

use aegis_core::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::keyring::{KeyAlgorithm, KeyMetadata, KeyPurpose, KeyState, KeyStore, StoredKey};

/// PostgreSQL-backed key store.
pub struct PostgresKeyStore {
    pool: PgPool,
}

impl PostgresKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Database row for encryption keys.
#[derive(Debug, sqlx::FromRow)]
struct KeyRow {
    key_id: String,
    purpose: String,
    algorithm: String,
    state: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    material: Vec<u8>,
}

impl KeyRow {
    fn into_stored(self) -> StoredKey {
        StoredKey {
            key_id: self.key_id,
            purpose: KeyPurpose::from_storage_str(&self.purpose),
            algorithm: parse_algorithm(&self.algorithm),
            state: parse_state(&self.state),
            created_at: self.created_at,
            expires_at: self.expires_at,
            material: self.material,
        }
    }
}

fn parse_algorithm(raw: &str) -> KeyAlgorithm {
    match raw {
        "rsa" => KeyAlgorithm::Rsa,
        _ => KeyAlgorithm::Aes256,
    }
}

fn algorithm_to_string(algorithm: KeyAlgorithm) -> &'static str {
    match algorithm {
        KeyAlgorithm::Aes256 => "aes256",
        KeyAlgorithm::Rsa => "rsa",
    }
}

/// Parse a state string from the database. Unknown strings fail closed to
/// retired, which still decrypts but refuses new encryption.
fn parse_state(raw: &str) -> KeyState {
    match raw {
        "active" => KeyState::Active,
        "rotated" => KeyState::Rotated,
        _ => KeyState::Retired,
    }
}

fn state_to_string(state: KeyState) -> &'static str {
    match state {
        KeyState::Active => "active",
        KeyState::Rotated => "rotated",
        KeyState::Retired => "retired",
    }
}

#[async_trait::async_trait]
impl KeyStore for PostgresKeyStore {
    async fn insert(&self, key: StoredKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO encryption_keys (key_id, purpose, algorithm, state, created_at, expires_at, material)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&key.key_id)
        .bind(key.purpose.as_storage_str())
        .bind(algorithm_to_string(key.algorithm))
        .bind(state_to_string(key.state))
        .bind(key.created_at)
        .bind(key.expires_at)
        .bind(&key.material)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, key_id: &str) -> Result<Option<StoredKey>> {
        let row: Option<KeyRow> = sqlx::query_as(
            r#"
            SELECT key_id, purpose, algorithm, state, created_at, expires_at, material
            FROM encryption_keys
            WHERE key_id = $1
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(KeyRow::into_stored))
    }

    async fn active_for(&self, purpose: &KeyPurpose) -> Result<Option<StoredKey>> {
        let row: Option<KeyRow> = sqlx::query_as(
            r#"
            SELECT key_id, purpose, algorithm, state, created_at, expires_at, material
            FROM encryption_keys
            WHERE purpose = $1 AND state = 'active'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(purpose.as_storage_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(KeyRow::into_stored))
    }

    async fn set_state(&self, key_id: &str, state: KeyState) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE encryption_keys SET state = $2 WHERE key_id = $1
            "#,
        )
        .bind(key_id)
        .bind(state_to_string(state))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<KeyMetadata>> {
        let rows: Vec<KeyRow> = sqlx::query_as(
            r#"
            SELECT key_id, purpose, algorithm, state, created_at, expires_at, material
            FROM encryption_keys
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| KeyMetadata::from(&row.into_stored()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(state_to_string(KeyState::Active), "active");
        assert_eq!(parse_state("active"), KeyState::Active);
        assert_eq!(parse_state("rotated"), KeyState::Rotated);
        assert_eq!(parse_state("retired"), KeyState::Retired);
        assert_eq!(parse_state("unknown"), KeyState::Retired);
    }

    #[test]
    fn test_purpose_storage_roundtrip() {
        for purpose in [
            KeyPurpose::Symmetric,
            KeyPurpose::Asymmetric,
            KeyPurpose::Feature("exports".to_string()),
        ] {
            let raw = purpose.as_storage_str();
            assert_eq!(KeyPurpose::from_storage_str(&raw), purpose);
        }
    }

    #[test]
    fn test_algorithm_mapping() {
        assert_eq!(algorithm_to_string(KeyAlgorithm::Rsa), "rsa");
        assert_eq!(parse_algorithm("aes256"), KeyAlgorithm::Aes256);
    }
}

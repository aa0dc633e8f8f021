//! PostgreSQL storage backends for credentials, sessions, and the
//! attempt log.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use aegis_core::Result;

use crate::attempts::{AttemptStore, AttemptWindow, LoginAttempt};
use crate::credentials::{CredentialStore, UserCredential};
use crate::session::{Session, SessionStatus, SessionStore};

/// PostgreSQL-backed credential store.
pub struct PostgresCredentialStore {
    pool: PgPool,
}

impl PostgresCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CredentialRow {
    user_id: Uuid,
    email: String,
    password_hash: String,
    mfa_secret: Option<String>,
    mfa_enabled: bool,
    backup_code_hashes: Vec<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CredentialRow {
    fn into_credential(self) -> UserCredential {
        UserCredential {
            user_id: self.user_id,
            email: self.email,
            password_hash: self.password_hash,
            mfa_secret: self.mfa_secret,
            mfa_enabled: self.mfa_enabled,
            backup_code_hashes: self.backup_code_hashes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[async_trait::async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn find_by_email(&self, email: &str) -> Result<Option<UserCredential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT user_id, email, password_hash, mfa_secret, mfa_enabled,
                   backup_code_hashes, created_at, updated_at
            FROM credentials
            WHERE email = $1
            "#,
        )
        .bind(email.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_credential()))
    }

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<UserCredential>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT user_id, email, password_hash, mfa_secret, mfa_enabled,
                   backup_code_hashes, created_at, updated_at
            FROM credentials
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into_credential()))
    }

    async fn insert(&self, credential: &UserCredential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, email, password_hash, mfa_secret,
                                     mfa_enabled, backup_code_hashes, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(credential.user_id)
        .bind(&credential.email)
        .bind(&credential.password_hash)
        .bind(&credential.mfa_secret)
        .bind(credential.mfa_enabled)
        .bind(&credential.backup_code_hashes)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_password(&self, user_id: Uuid, password_hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET password_hash = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(password_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_mfa(&self, user_id: Uuid, secret: Option<&str>, enabled: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET mfa_secret = $2, mfa_enabled = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(secret)
        .bind(enabled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_backup_codes(&self, user_id: Uuid, code_hashes: &[String]) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET backup_code_hashes = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn consume_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool> {
        // Single statement so two racing submissions cannot both consume
        // the same code
        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET backup_code_hashes = array_remove(backup_code_hashes, $2), updated_at = NOW()
            WHERE user_id = $1 AND $2 = ANY(backup_code_hashes)
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// PostgreSQL-backed session store.
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    session_id: String,
    user_id: Uuid,
    device_fingerprint: String,
    origin_address: String,
    user_agent: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    status: String,
    risk_score: f64,
    location: Option<String>,
}

impl SessionRow {
    fn into_session(self) -> Session {
        Session {
            session_id: self.session_id,
            user_id: self.user_id,
            device_fingerprint: self.device_fingerprint,
            origin_address: self.origin_address,
            user_agent: self.user_agent,
            created_at: self.created_at,
            last_activity: self.last_activity,
            expires_at: self.expires_at,
            status: parse_status(&self.status),
            risk_score: self.risk_score,
            location: self.location,
        }
    }
}

/// Parse a status string from the database. Unknown strings fail closed.
fn parse_status(status: &str) -> SessionStatus {
    match status {
        "active" => SessionStatus::Active,
        "expired" => SessionStatus::Expired,
        "revoked" => SessionStatus::Revoked,
        "suspicious" => SessionStatus::Suspicious,
        _ => SessionStatus::Revoked,
    }
}

/// Serialize a status for the database.
fn status_to_string(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Expired => "expired",
        SessionStatus::Revoked => "revoked",
        SessionStatus::Suspicious => "suspicious",
    }
}

const SESSION_COLUMNS: &str = "session_id, user_id, device_fingerprint, origin_address, \
     user_agent, created_at, last_activity, expires_at, status, risk_score, location";

#[async_trait::async_trait]
impl SessionStore for PostgresSessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, user_id, device_fingerprint, origin_address,
                                  user_agent, created_at, last_activity, expires_at,
                                  status, risk_score, location)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&session.session_id)
        .bind(session.user_id)
        .bind(&session.device_fingerprint)
        .bind(&session.origin_address)
        .bind(&session.user_agent)
        .bind(session.created_at)
        .bind(session.last_activity)
        .bind(session.expires_at)
        .bind(status_to_string(session.status))
        .bind(session.risk_score)
        .bind(&session.location)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE session_id = $1", SESSION_COLUMNS);
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into_session()))
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = $2, last_activity = $3
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(status_to_string(status))
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET last_activity = $2
            WHERE session_id = $1
            "#,
        )
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE user_id = $1 AND status = 'active' ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into_session()).collect())
    }

    async fn all_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE user_id = $1 ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into_session()).collect())
    }

    async fn device_use_count(&self, user_id: Uuid, device_fingerprint: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM sessions
            WHERE user_id = $1 AND device_fingerprint = $2
            "#,
        )
        .bind(user_id)
        .bind(device_fingerprint)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn origin_seen(&self, user_id: Uuid, origin_address: &str) -> Result<bool> {
        let (seen,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM sessions
                WHERE user_id = $1 AND origin_address = $2
            )
            "#,
        )
        .bind(user_id)
        .bind(origin_address)
        .fetch_one(&self.pool)
        .await?;

        Ok(seen)
    }
}

/// PostgreSQL-backed attempt log.
pub struct PostgresAttemptStore {
    pool: PgPool,
}

impl PostgresAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AttemptRow {
    id: i64,
    user_id: Option<Uuid>,
    email: String,
    origin_address: String,
    success: bool,
    details: Option<String>,
    timestamp: DateTime<Utc>,
}

impl AttemptRow {
    fn into_attempt(self) -> LoginAttempt {
        LoginAttempt {
            id: self.id,
            user_id: self.user_id,
            email: self.email,
            origin_address: self.origin_address,
            success: self.success,
            details: self.details,
            timestamp: self.timestamp,
        }
    }
}

#[async_trait::async_trait]
impl AttemptStore for PostgresAttemptStore {
    async fn record(&self, attempt: &LoginAttempt) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO login_attempts (user_id, email, origin_address, success, details, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(attempt.user_id)
        .bind(&attempt.email)
        .bind(&attempt.origin_address)
        .bind(attempt.success)
        .bind(&attempt.details)
        .bind(attempt.timestamp)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn window_for_user(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<AttemptWindow> {
        let (total, failures, last_failure): (i64, i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE NOT success),
                   MAX(timestamp) FILTER (WHERE NOT success)
            FROM login_attempts
            WHERE user_id = $1 AND timestamp >= $2
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(AttemptWindow {
            total: total as u32,
            failures: failures as u32,
            last_failure,
        })
    }

    async fn window_for_email(&self, email: &str, since: DateTime<Utc>) -> Result<AttemptWindow> {
        let (total, failures, last_failure): (i64, i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE NOT success),
                   MAX(timestamp) FILTER (WHERE NOT success)
            FROM login_attempts
            WHERE email = $1 AND timestamp >= $2
            "#,
        )
        .bind(email.to_lowercase())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(AttemptWindow {
            total: total as u32,
            failures: failures as u32,
            last_failure,
        })
    }

    async fn recent_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<LoginAttempt>> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT id, user_id, email, origin_address, success, details, timestamp
            FROM login_attempts
            WHERE user_id = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into_attempt()).collect())
    }
}

//! Session lifecycle across the durable store and the cache.
//!
//! The durable row is the system of record; the cache entry is the liveness
//! authority. A session is usable only while its cache mirror exists, so a
//! cache miss means "not valid" even when a durable row says active. Create
//! writes the durable row first, then the mirror; revoke removes the mirror
//! first, then flips the row. A crash between the two halves therefore never
//! leaves a usable session without a durable record.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use aegis_core::cache::{get_json, set_json};
use aegis_core::config::{SessionConfig, TimeoutConfig};
use aegis_core::{Cache, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
    Suspicious,
}

/// One authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// 32 random bytes, hex encoded
    pub session_id: String,
    pub user_id: Uuid,
    pub device_fingerprint: String,
    pub origin_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Risk score computed at login time
    pub risk_score: f64,
    /// Resolved location, when geolocation answered in time
    pub location: Option<String>,
}

/// Durable storage backend for sessions.
///
/// Also answers the history questions risk scoring asks: how often a device
/// has been used and whether an origin has been seen before.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    /// Update status and stamp last_activity. False if no such session.
    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn active_for_user(&self, user_id: Uuid) -> Result<Vec<Session>>;

    async fn all_for_user(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Sessions this user has ever created from this device.
    async fn device_use_count(&self, user_id: Uuid, device_fingerprint: &str) -> Result<i64>;

    async fn origin_seen(&self, user_id: Uuid, origin_address: &str) -> Result<bool>;
}

/// In-memory session store for tests and development.
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn set_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.status = status;
                session.last_activity = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.last_activity = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == user_id && s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn all_for_user(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut matching: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }

    async fn device_use_count(&self, user_id: Uuid, device_fingerprint: &str) -> Result<i64> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_id == user_id && s.device_fingerprint == device_fingerprint)
            .count() as i64)
    }

    async fn origin_seen(&self, user_id: Uuid, origin_address: &str) -> Result<bool> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .any(|s| s.user_id == user_id && s.origin_address == origin_address))
    }
}

/// Generate an unguessable session identifier.
pub fn generate_session_id() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn cache_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Coordinates the durable store and the cache mirror.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cache: Arc<dyn Cache>,
    config: SessionConfig,
    timeouts: TimeoutConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        cache: Arc<dyn Cache>,
        config: SessionConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            cache,
            config,
            timeouts,
        }
    }

    async fn bounded_cache<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(StdDuration::from_millis(self.timeouts.cache_op_ms), op).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientStore {
                message: format!("cache operation timed out after {}ms", self.timeouts.cache_op_ms),
            }),
        }
    }

    async fn bounded_store<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(StdDuration::from_millis(self.timeouts.store_op_ms), op).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientStore {
                message: format!("store operation timed out after {}ms", self.timeouts.store_op_ms),
            }),
        }
    }

    async fn cached_session(&self, session_id: &str) -> Result<Option<Session>> {
        let key = cache_key(session_id);
        self.bounded_cache(get_json::<Session>(self.cache.as_ref(), &key))
            .await
    }

    /// Create a session: durable row first, cache mirror second.
    ///
    /// Failure of either write is fatal to the login; the caller gets a
    /// transient-store error rather than a session that might not stick.
    pub async fn create(
        &self,
        user_id: Uuid,
        device_fingerprint: &str,
        origin_address: &str,
        user_agent: &str,
        risk_score: f64,
        location: Option<String>,
    ) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            session_id: generate_session_id(),
            user_id,
            device_fingerprint: device_fingerprint.to_string(),
            origin_address: origin_address.to_string(),
            user_agent: user_agent.to_string(),
            created_at: now,
            last_activity: now,
            expires_at: now + Duration::hours(self.config.lifetime_hours),
            status: SessionStatus::Active,
            risk_score,
            location,
        };

        self.bounded_store(self.store.insert(&session))
            .await
            .map_err(|e| {
                warn!(security = true, user_id = %user_id, error = %e, "Session create failed in durable store");
                Error::TransientStore {
                    message: format!("session create failed: {}", e),
                }
            })?;

        let ttl = StdDuration::from_secs(self.config.lifetime_hours as u64 * 3600);
        let key = cache_key(&session.session_id);
        if let Err(e) = self
            .bounded_cache(set_json(self.cache.as_ref(), &key, &session, Some(ttl)))
            .await
        {
            // The durable row stays behind as active but is unusable
            // without its mirror; it ages out at expires_at.
            warn!(security = true, user_id = %user_id, error = %e, "Session mirror write failed");
            return Err(Error::TransientStore {
                message: format!("session cache write failed: {}", e),
            });
        }

        info!(
            security = true,
            user_id = %user_id,
            session_id = %session.session_id,
            risk_score = session.risk_score,
            "Session created"
        );
        Ok(session)
    }

    /// Liveness check against the cache mirror.
    ///
    /// A missing mirror is an invalid session, full stop. An expired mirror
    /// is dropped here and the durable row flipped to expired on a
    /// best-effort basis. A transient cache error is retried once and then
    /// propagated, since neither "valid" nor "invalid" would be truthful.
    pub async fn validate(&self, session_id: &str) -> Result<bool> {
        let cached = match self.cached_session(session_id).await {
            Ok(cached) => cached,
            Err(first) => {
                warn!(error = %first, "Session cache read failed, retrying once");
                self.cached_session(session_id).await?
            }
        };

        let session = match cached {
            Some(session) => session,
            None => return Ok(false),
        };

        if session.status != SessionStatus::Active {
            let _ = self.bounded_cache(self.cache.delete(&cache_key(session_id))).await;
            return Ok(false);
        }

        let now = Utc::now();
        if session.expires_at <= now {
            let _ = self.bounded_cache(self.cache.delete(&cache_key(session_id))).await;
            if let Err(e) = self
                .bounded_store(self.store.set_status(session_id, SessionStatus::Expired, now))
                .await
            {
                warn!(session_id = %session_id, error = %e, "Failed to mark expired session in durable store");
            }
            return Ok(false);
        }

        Ok(true)
    }

    /// Record activity on a validated session in both stores.
    ///
    /// Freshness is advisory; trouble here is logged, never surfaced.
    pub async fn touch(&self, session_id: &str) {
        let now = Utc::now();

        match self.cached_session(session_id).await {
            Ok(Some(mut session)) => {
                session.last_activity = now;
                let remaining = (session.expires_at - now).num_seconds();
                if remaining > 0 {
                    let ttl = StdDuration::from_secs(remaining as u64);
                    let key = cache_key(session_id);
                    if let Err(e) = self
                        .bounded_cache(set_json(self.cache.as_ref(), &key, &session, Some(ttl)))
                        .await
                    {
                        warn!(session_id = %session_id, error = %e, "Session touch failed in cache");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Session touch failed reading cache");
            }
        }

        if let Err(e) = self.bounded_store(self.store.touch(session_id, now)).await {
            warn!(session_id = %session_id, error = %e, "Session touch failed in durable store");
        }
    }

    /// Revoke one session: mirror out first so it stops validating, then
    /// the durable row. Returns whether a durable row existed.
    pub async fn revoke(&self, session_id: &str) -> Result<bool> {
        let key = cache_key(session_id);
        if let Err(first) = self.bounded_cache(self.cache.delete(&key)).await {
            warn!(error = %first, "Session mirror delete failed, retrying once");
            self.bounded_cache(self.cache.delete(&key)).await?;
        }

        let existed = self
            .bounded_store(self.store.set_status(session_id, SessionStatus::Revoked, Utc::now()))
            .await?;

        if existed {
            info!(security = true, session_id = %session_id, "Session revoked");
        }
        Ok(existed)
    }

    /// Revoke every active session a user has. Returns how many were ended.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u32> {
        let sessions = self.bounded_store(self.store.active_for_user(user_id)).await?;

        let mut revoked = 0u32;
        for session in &sessions {
            if self.revoke(&session.session_id).await? {
                revoked += 1;
            }
        }

        info!(security = true, user_id = %user_id, revoked = revoked, "All sessions revoked");
        Ok(revoked)
    }

    /// Mark a session suspicious without destroying history, dropping the
    /// mirror so it can no longer validate.
    pub async fn mark_suspicious(&self, session_id: &str) -> Result<bool> {
        let key = cache_key(session_id);
        if let Err(first) = self.bounded_cache(self.cache.delete(&key)).await {
            warn!(error = %first, "Session mirror delete failed, retrying once");
            self.bounded_cache(self.cache.delete(&key)).await?;
        }

        let existed = self
            .bounded_store(self.store.set_status(session_id, SessionStatus::Suspicious, Utc::now()))
            .await?;
        if existed {
            warn!(security = true, session_id = %session_id, "Session marked suspicious");
        }
        Ok(existed)
    }

    /// Every session on record for the user, newest first.
    pub async fn sessions_for(&self, user_id: Uuid) -> Result<Vec<Session>> {
        self.bounded_store(self.store.all_for_user(user_id)).await
    }
}

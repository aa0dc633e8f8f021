//! Login attempt log.
//!
//! Every credential check writes an attempt row before the caller sees the
//! outcome, so lockout decisions and risk scoring always observe their own
//! writes. Attempts against unknown emails are recorded with no user id to
//! keep probing visible without leaking which accounts exist.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use aegis_core::Result;

/// A single authentication attempt, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAttempt {
    /// Storage-assigned id (0 until recorded)
    pub id: i64,
    /// Resolved account, if the email matched one
    pub user_id: Option<Uuid>,
    /// Email as presented, lowercased
    pub email: String,
    /// Network origin of the attempt
    pub origin_address: String,
    /// Whether credentials (and MFA, if required) checked out
    pub success: bool,
    /// Failure detail for operators; never shown to the caller
    pub details: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn builder(
        email: impl Into<String>,
        origin_address: impl Into<String>,
    ) -> LoginAttemptBuilder {
        LoginAttemptBuilder {
            user_id: None,
            email: email.into().to_lowercase(),
            origin_address: origin_address.into(),
            success: false,
            details: None,
        }
    }
}

/// Builder for [`LoginAttempt`] records.
pub struct LoginAttemptBuilder {
    user_id: Option<Uuid>,
    email: String,
    origin_address: String,
    success: bool,
    details: Option<String>,
}

impl LoginAttemptBuilder {
    pub fn user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn success(mut self) -> Self {
        self.success = true;
        self.details = None;
        self
    }

    pub fn failure(mut self, details: impl Into<String>) -> Self {
        self.success = false;
        self.details = Some(details.into());
        self
    }

    pub fn build(self) -> LoginAttempt {
        LoginAttempt {
            id: 0,
            user_id: self.user_id,
            email: self.email,
            origin_address: self.origin_address,
            success: self.success,
            details: self.details,
            timestamp: Utc::now(),
        }
    }
}

/// Aggregate view of attempts inside a time window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptWindow {
    pub total: u32,
    pub failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
}

impl AttemptWindow {
    pub const EMPTY: AttemptWindow = AttemptWindow {
        total: 0,
        failures: 0,
        last_failure: None,
    };
}

/// Storage backend for the attempt log.
///
/// Writes must be durable before `record` returns; lockout is recomputed
/// from this log on every check rather than cached.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Persist an attempt and return its assigned id.
    async fn record(&self, attempt: &LoginAttempt) -> Result<i64>;

    /// Attempts for a known user since the given instant.
    async fn window_for_user(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<AttemptWindow>;

    /// Attempts against an email (resolved or not) since the given instant.
    async fn window_for_email(&self, email: &str, since: DateTime<Utc>) -> Result<AttemptWindow>;

    /// Most recent attempts for a user, newest first.
    async fn recent_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<LoginAttempt>>;
}

/// In-memory attempt store for tests and development.
pub struct MemoryAttemptStore {
    attempts: Arc<RwLock<Vec<LoginAttempt>>>,
    next_id: AtomicI64,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self {
            attempts: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for MemoryAttemptStore {
    fn default() -> Self {
        Self::new()
    }
}

fn window_of<'a>(attempts: impl Iterator<Item = &'a LoginAttempt>) -> AttemptWindow {
    let mut window = AttemptWindow::EMPTY;
    for attempt in attempts {
        window.total += 1;
        if !attempt.success {
            window.failures += 1;
            window.last_failure = match window.last_failure {
                Some(existing) if existing >= attempt.timestamp => Some(existing),
                _ => Some(attempt.timestamp),
            };
        }
    }
    window
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn record(&self, attempt: &LoginAttempt) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = attempt.clone();
        stored.id = id;

        let mut attempts = self.attempts.write().await;
        attempts.push(stored);
        Ok(id)
    }

    async fn window_for_user(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<AttemptWindow> {
        let attempts = self.attempts.read().await;
        Ok(window_of(attempts.iter().filter(|a| {
            a.user_id == Some(user_id) && a.timestamp >= since
        })))
    }

    async fn window_for_email(&self, email: &str, since: DateTime<Utc>) -> Result<AttemptWindow> {
        let email = email.to_lowercase();
        let attempts = self.attempts.read().await;
        Ok(window_of(
            attempts
                .iter()
                .filter(|a| a.email == email && a.timestamp >= since),
        ))
    }

    async fn recent_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<LoginAttempt>> {
        let attempts = self.attempts.read().await;
        let mut matching: Vec<LoginAttempt> = attempts
            .iter()
            .filter(|a| a.user_id == Some(user_id))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}

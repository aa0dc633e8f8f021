//! Adaptive risk scoring for authentication attempts.
//!
//! Scores are additive over independent signals and capped at 1.0. The
//! scorer never fails a login: when history cannot be read it reports the
//! configured fallback score, and a slow or broken geolocation backend
//! degrades to an unknown location.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Timelike, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use aegis_core::config::{RiskConfig, TimeoutConfig};
use aegis_core::{Error, Result};

use crate::attempts::AttemptStore;
use crate::session::SessionStore;

/// Where an origin address appears to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Known { country: String, city: String },
    Unknown,
}

impl Location {
    /// Display string stored on the session, when there is one.
    pub fn display(&self) -> Option<String> {
        match self {
            Location::Known { country, city } => Some(format!("{}, {}", city, country)),
            Location::Unknown => None,
        }
    }
}

/// Resolves network origins to coarse locations.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn locate(&self, origin_address: &str) -> Result<Location>;
}

/// Lookup that knows nothing; the default when no geo backend is wired up.
pub struct NoGeoLookup;

#[async_trait]
impl GeoLookup for NoGeoLookup {
    async fn locate(&self, _origin_address: &str) -> Result<Location> {
        Ok(Location::Unknown)
    }
}

/// Outcome of scoring one attempt.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    /// Additive score in [0.0, 1.0]
    pub score: f64,
    pub location: Location,
    /// Signals that contributed, for logs and operator review
    pub factors: Vec<&'static str>,
}

struct RiskInputs {
    device_uses: i64,
    origin_seen: bool,
    hour: u32,
    recent_failures: u32,
}

/// Scores attempts from device, origin, time-of-day, and failure history.
pub struct RiskScorer {
    sessions: Arc<dyn SessionStore>,
    attempts: Arc<dyn AttemptStore>,
    geo: Arc<dyn GeoLookup>,
    config: RiskConfig,
    timeouts: TimeoutConfig,
}

impl RiskScorer {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        attempts: Arc<dyn AttemptStore>,
        geo: Arc<dyn GeoLookup>,
        config: RiskConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            sessions,
            attempts,
            geo,
            config,
            timeouts,
        }
    }

    /// Whether a score demands MFA step-up. The threshold is exclusive:
    /// a score exactly at it does not trigger.
    pub fn requires_step_up(&self, score: f64) -> bool {
        self.config.step_up_enabled && score > self.config.step_up_threshold
    }

    /// Score an attempt. Infallible by design: history trouble yields the
    /// fallback score rather than an error.
    pub async fn assess(
        &self,
        user_id: Uuid,
        device_fingerprint: &str,
        origin_address: &str,
        user_agent: &str,
    ) -> RiskAssessment {
        let location = self.locate(origin_address).await;

        let inputs = match self.gather(user_id, device_fingerprint, origin_address).await {
            Ok(inputs) => inputs,
            Err(e) => {
                warn!(
                    security = true,
                    user_id = %user_id,
                    error = %e,
                    fallback = self.config.fallback_score,
                    "Risk history unavailable, using fallback score"
                );
                return RiskAssessment {
                    score: self.config.fallback_score,
                    location,
                    factors: vec!["history_unavailable"],
                };
            }
        };

        let (score, factors) = self.compute(&inputs);
        debug!(
            user_id = %user_id,
            score = score,
            factors = ?factors,
            user_agent = %user_agent,
            "Risk assessed"
        );
        RiskAssessment {
            score,
            location,
            factors,
        }
    }

    fn compute(&self, inputs: &RiskInputs) -> (f64, Vec<&'static str>) {
        let mut score = 0.0;
        let mut factors = Vec::new();

        if inputs.device_uses == 0 {
            score += self.config.new_device_weight;
            factors.push("new_device");
        } else if inputs.device_uses < self.config.familiar_device_uses {
            score += self.config.rare_device_weight;
            factors.push("rare_device");
        }

        if !inputs.origin_seen {
            score += self.config.new_origin_weight;
            factors.push("new_origin");
        }

        if inputs.hour < self.config.day_start_hour || inputs.hour >= self.config.day_end_hour {
            score += self.config.odd_hours_weight;
            factors.push("odd_hours");
        }

        if inputs.recent_failures > 0 {
            let contribution = (inputs.recent_failures as f64 * self.config.failed_attempt_weight)
                .min(self.config.failed_attempt_cap);
            score += contribution;
            factors.push("recent_failures");
        }

        (score.min(1.0), factors)
    }

    async fn bounded<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(StdDuration::from_millis(self.timeouts.store_op_ms), op).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientStore {
                message: format!(
                    "risk history read timed out after {}ms",
                    self.timeouts.store_op_ms
                ),
            }),
        }
    }

    async fn gather(
        &self,
        user_id: Uuid,
        device_fingerprint: &str,
        origin_address: &str,
    ) -> Result<RiskInputs> {
        let device_uses = self
            .bounded(self.sessions.device_use_count(user_id, device_fingerprint))
            .await?;
        let origin_seen = self
            .bounded(self.sessions.origin_seen(user_id, origin_address))
            .await?;
        let since = Utc::now() - Duration::hours(24);
        let window = self
            .bounded(self.attempts.window_for_user(user_id, since))
            .await?;

        Ok(RiskInputs {
            device_uses,
            origin_seen,
            hour: Utc::now().hour(),
            recent_failures: window.failures,
        })
    }

    async fn locate(&self, origin_address: &str) -> Location {
        let op = self.geo.locate(origin_address);
        match tokio::time::timeout(StdDuration::from_millis(self.timeouts.geo_lookup_ms), op).await
        {
            Ok(Ok(location)) => location,
            Ok(Err(e)) => {
                debug!(error = %e, "Geolocation failed, treating location as unknown");
                Location::Unknown
            }
            Err(_) => {
                debug!(
                    timeout_ms = self.timeouts.geo_lookup_ms,
                    "Geolocation timed out, treating location as unknown"
                );
                Location::Unknown
            }
        }
    }
}

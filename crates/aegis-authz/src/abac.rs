//! Attribute-based access control.
//!
//! A short-circuiting conjunction over a fixed, ordered rule list. Each rule
//! is one function; adding a rule means adding a function to [`RULES`], not
//! parsing a policy document. Rules that find no constraint to apply pass,
//! so an unconstrained request is allowed.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

/// Who is asking.
#[derive(Debug, Clone)]
pub struct SubjectAttributes {
    pub user_id: Uuid,
    /// Clearance level, 0 (public data only) through 3 (restricted).
    pub clearance: u8,
    /// Largest transaction amount this subject may move, if bounded.
    pub max_amount: Option<Decimal>,
}

impl SubjectAttributes {
    pub fn new(user_id: Uuid, clearance: u8) -> Self {
        Self {
            user_id,
            clearance,
            max_amount: None,
        }
    }

    pub fn with_max_amount(mut self, max_amount: Decimal) -> Self {
        self.max_amount = Some(max_amount);
        self
    }
}

/// What is being touched.
#[derive(Debug, Clone, Default)]
pub struct ResourceAttributes {
    /// Sensitivity level, 0 (public) through 3 (restricted).
    pub sensitivity: u8,
    /// UTC hours during which the resource may be touched, as a half-open
    /// `[start, end)` range. A start above the end wraps past midnight.
    pub allowed_hours: Option<(u8, u8)>,
    /// Locations the resource may be touched from.
    pub allowed_locations: Option<Vec<String>>,
}

/// What is being done.
#[derive(Debug, Clone, Default)]
pub struct ActionAttributes {
    pub name: String,
    pub amount: Option<Decimal>,
}

/// The circumstances of the request.
#[derive(Debug, Clone)]
pub struct EnvironmentAttributes {
    pub at: DateTime<Utc>,
    pub location: Option<String>,
}

impl EnvironmentAttributes {
    pub fn now() -> Self {
        Self {
            at: Utc::now(),
            location: None,
        }
    }
}

type Rule = fn(
    &SubjectAttributes,
    &ResourceAttributes,
    &ActionAttributes,
    &EnvironmentAttributes,
) -> bool;

/// The policy, in evaluation order.
const RULES: &[(&str, Rule)] = &[
    ("allowed_hours", within_allowed_hours),
    ("allowed_locations", from_allowed_location),
    ("clearance", clearance_covers_sensitivity),
    ("amount_ceiling", within_amount_ceiling),
];

fn within_allowed_hours(
    _subject: &SubjectAttributes,
    resource: &ResourceAttributes,
    _action: &ActionAttributes,
    environment: &EnvironmentAttributes,
) -> bool {
    match resource.allowed_hours {
        Some((start, end)) => {
            let hour = environment.at.time().hour() as u8;
            if start <= end {
                hour >= start && hour < end
            } else {
                hour >= start || hour < end
            }
        }
        None => true,
    }
}

fn from_allowed_location(
    _subject: &SubjectAttributes,
    resource: &ResourceAttributes,
    _action: &ActionAttributes,
    environment: &EnvironmentAttributes,
) -> bool {
    match &resource.allowed_locations {
        Some(allowed) => match &environment.location {
            Some(location) => allowed
                .iter()
                .any(|entry| entry.eq_ignore_ascii_case(location)),
            // An unknown location never satisfies a restricted resource.
            None => false,
        },
        None => true,
    }
}

fn clearance_covers_sensitivity(
    subject: &SubjectAttributes,
    resource: &ResourceAttributes,
    _action: &ActionAttributes,
    _environment: &EnvironmentAttributes,
) -> bool {
    subject.clearance >= resource.sensitivity
}

fn within_amount_ceiling(
    subject: &SubjectAttributes,
    _resource: &ResourceAttributes,
    action: &ActionAttributes,
    _environment: &EnvironmentAttributes,
) -> bool {
    match (action.amount, subject.max_amount) {
        (Some(amount), Some(max)) => amount <= max,
        _ => true,
    }
}

fn first_failure(
    subject: &SubjectAttributes,
    resource: &ResourceAttributes,
    action: &ActionAttributes,
    environment: &EnvironmentAttributes,
) -> Option<&'static str> {
    for &(name, rule) in RULES {
        if !rule(subject, resource, action, environment) {
            return Some(name);
        }
    }
    None
}

/// Evaluate the rule list, stopping at the first rule that denies.
pub fn evaluate(
    subject: &SubjectAttributes,
    resource: &ResourceAttributes,
    action: &ActionAttributes,
    environment: &EnvironmentAttributes,
) -> bool {
    match first_failure(subject, resource, action, environment) {
        None => {
            debug!(user_id = %subject.user_id, action = %action.name, "Attribute policy allowed access");
            true
        }
        Some(rule) => {
            warn!(
                security = true,
                user_id = %subject.user_id,
                action = %action.name,
                rule = rule,
                "Attribute policy denied access"
            );
            false
        }
    }
}

//! Role-based access control.
//!
//! Permissions are granted through named roles with optional inheritance.
//! Resolution walks the role graph once per user and caches the flattened
//! permission set for a short TTL; assigning or revoking a role invalidates
//! that user's cache entry so the change takes effect immediately. Role
//! edits (grants) rely on TTL expiry instead, since affected users cannot
//! be enumerated from a role name. Ownership-gated resources additionally
//! require the caller to own the specific record unless an admin-equivalent
//! permission is held.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use aegis_core::cache::{get_json, set_json};
use aegis_core::config::{RbacConfig, TimeoutConfig};
use aegis_core::{Cache, Error, Result};

/// Permission action types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    // Basic CRUD
    Create,
    Read,
    Update,
    Delete,

    // Money movement
    Transfer,
    Approve,

    // Admin specific
    Manage,
    Configure,
    Export,

    // Special
    All,
}

impl Action {
    /// Check if this action includes another.
    pub fn includes(&self, other: &Action) -> bool {
        *self == Action::All || *self == *other
    }
}

/// Resource types in the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resource {
    // Owned financial records
    Account,
    Portfolio,
    Transaction,

    // Security objects
    User,
    Role,
    Session,
    ApiKey,

    // Operational data
    AuditLog,
    Report,
    SystemConfig,

    // A single record of a given type
    Specific {
        resource_type: String,
        resource_id: String,
    },

    // All resources
    All,
}

impl Resource {
    /// Create a specific resource reference.
    pub fn specific(resource_type: &str, resource_id: &str) -> Self {
        Self::Specific {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    /// Check if this resource matches another.
    pub fn matches(&self, other: &Resource) -> bool {
        match (self, other) {
            (Resource::All, _) => true,
            (_, Resource::All) => true,
            (a, b) if a == b => true,
            (
                Resource::Specific {
                    resource_type: t1, ..
                },
                Resource::Specific {
                    resource_type: t2, ..
                },
            ) => t1 == t2,
            _ => false,
        }
    }

    /// Whether access to an identified record of this type is gated on
    /// owning it.
    pub fn requires_ownership(&self) -> bool {
        match self {
            Resource::Account | Resource::Portfolio => true,
            Resource::Specific { resource_type, .. } => {
                resource_type == "account" || resource_type == "portfolio"
            }
            _ => false,
        }
    }
}

/// A permission grants an action on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: Resource,
    pub action: Action,
    /// Optional conditions for the permission.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<PermissionConditions>,
}

impl Permission {
    /// Create a new permission.
    pub fn new(resource: Resource, action: Action) -> Self {
        Self {
            resource,
            action,
            conditions: None,
        }
    }

    /// Add conditions to the permission.
    pub fn with_conditions(mut self, conditions: PermissionConditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Check if this permission grants the requested action on a resource.
    pub fn grants(&self, resource: &Resource, action: &Action) -> bool {
        self.resource.matches(resource) && self.action.includes(action)
    }
}

/// Conditions that can be attached to permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionConditions {
    /// Time-based restrictions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    /// Origin addresses the permission may be exercised from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_allow_list: Option<Vec<String>>,
    /// Ceiling on the transaction amount this permission covers. A user's
    /// effective ceiling is the maximum across all roles that grant the
    /// action; a granting role without a ceiling means no ceiling at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_amount: Option<Decimal>,
}

/// Time window for permission validity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Start hour (0-23), inclusive.
    pub start_hour: u8,
    /// End hour (0-23), exclusive. A start above the end wraps past midnight.
    pub end_hour: u8,
    /// Allowed days (0 = Sunday, 6 = Saturday).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_days: Option<Vec<u8>>,
}

impl TimeWindow {
    /// Check if the given instant is within the window.
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        let hour = at.time().hour() as u8;
        let day = at.weekday().num_days_from_sunday() as u8;

        let in_hours = if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            // Wraps around midnight
            hour >= self.start_hour || hour < self.end_hour
        };

        let in_days = self
            .allowed_days
            .as_ref()
            .map(|days| days.contains(&day))
            .unwrap_or(true);

        in_hours && in_days
    }

    /// Check if the current time is within the window.
    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

/// A role is a named collection of permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub description: String,
    pub permissions: HashSet<Permission>,
    /// Parent roles (inherits their permissions).
    pub inherits: Vec<String>,
    /// Is this a system role that cannot be modified?
    pub system_role: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// Create a new role.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: description.into(),
            permissions: HashSet::new(),
            inherits: Vec::new(),
            system_role: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a permission to the role.
    pub fn add_permission(&mut self, permission: Permission) {
        self.permissions.insert(permission);
        self.updated_at = Utc::now();
    }

    /// Remove a permission from the role.
    pub fn remove_permission(&mut self, permission: &Permission) -> bool {
        let removed = self.permissions.remove(permission);
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Add a parent role to inherit from.
    pub fn inherit_from(&mut self, role_name: impl Into<String>) {
        self.inherits.push(role_name.into());
        self.updated_at = Utc::now();
    }

    /// Mark as system role.
    pub fn as_system_role(mut self) -> Self {
        self.system_role = true;
        self
    }
}

/// Default roles for the system.
pub struct DefaultRoles;

impl DefaultRoles {
    /// Read-only access to accounts, portfolios, and reporting.
    pub fn viewer() -> Role {
        let mut role =
            Role::new("viewer", "Read-only access to accounts and reports").as_system_role();

        role.add_permission(Permission::new(Resource::Account, Action::Read));
        role.add_permission(Permission::new(Resource::Portfolio, Action::Read));
        role.add_permission(Permission::new(Resource::Transaction, Action::Read));
        role.add_permission(Permission::new(Resource::Report, Action::Read));

        role
    }

    /// Day-to-day account and portfolio management with a capped transfer
    /// ceiling.
    pub fn operator() -> Role {
        let mut role =
            Role::new("operator", "Manages accounts and portfolios, capped transfers")
                .as_system_role();

        role.inherit_from("viewer");

        role.add_permission(Permission::new(Resource::Account, Action::Create));
        role.add_permission(Permission::new(Resource::Account, Action::Update));
        role.add_permission(Permission::new(Resource::Portfolio, Action::Create));
        role.add_permission(Permission::new(Resource::Portfolio, Action::Update));
        role.add_permission(Permission::new(Resource::Transaction, Action::Create));
        role.add_permission(
            Permission::new(Resource::Transaction, Action::Transfer).with_conditions(
                PermissionConditions {
                    max_amount: Some(Decimal::from(10_000)),
                    ..Default::default()
                },
            ),
        );

        role
    }

    /// Uncapped transfers and transaction approval.
    pub fn treasurer() -> Role {
        let mut role = Role::new("treasurer", "Approves and executes uncapped transfers");

        role.inherit_from("operator");

        role.add_permission(Permission::new(Resource::Transaction, Action::Transfer));
        role.add_permission(Permission::new(Resource::Transaction, Action::Approve));

        role
    }

    /// Read access to the security trail.
    pub fn auditor() -> Role {
        let mut role = Role::new("auditor", "Reviews audit logs and exports reports");

        role.inherit_from("viewer");

        role.add_permission(Permission::new(Resource::AuditLog, Action::Read));
        role.add_permission(Permission::new(Resource::Session, Action::Read));
        role.add_permission(Permission::new(Resource::Report, Action::Export));

        role
    }

    /// Full access including configuration.
    pub fn admin() -> Role {
        let mut role = Role::new("admin", "Full access including configuration").as_system_role();

        role.inherit_from("operator");

        role.add_permission(Permission::new(Resource::All, Action::All));
        role.add_permission(Permission::new(Resource::User, Action::Manage));
        role.add_permission(Permission::new(Resource::Role, Action::Manage));
        role.add_permission(Permission::new(Resource::ApiKey, Action::Manage));
        role.add_permission(Permission::new(Resource::SystemConfig, Action::Configure));
        role.add_permission(Permission::new(Resource::AuditLog, Action::Read));
        role.add_permission(Permission::new(Resource::Report, Action::Export));

        role
    }

    /// Get all default roles.
    pub fn all() -> Vec<Role> {
        vec![
            Self::viewer(),
            Self::operator(),
            Self::treasurer(),
            Self::auditor(),
            Self::admin(),
        ]
    }
}

/// Coarse risk label attached to every authorization decision, for the audit
/// trail. Never a gate by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    fn escalated(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium | RiskLevel::High => RiskLevel::High,
        }
    }
}

fn action_severity(action: &Action) -> u8 {
    match action {
        Action::Read => 1,
        Action::Create | Action::Update | Action::Export => 2,
        Action::Delete
        | Action::Transfer
        | Action::Approve
        | Action::Manage
        | Action::Configure
        | Action::All => 3,
    }
}

fn resource_sensitivity(resource: &Resource) -> u8 {
    match resource {
        Resource::Report => 1,
        Resource::Account
        | Resource::Portfolio
        | Resource::Session
        | Resource::ApiKey
        | Resource::Specific { .. } => 2,
        Resource::Transaction
        | Resource::User
        | Resource::Role
        | Resource::AuditLog
        | Resource::SystemConfig
        | Resource::All => 3,
    }
}

/// Label a decision from action severity and resource sensitivity; a context
/// amount at or above `high_risk_amount` escalates the label one step.
pub fn risk_label(
    resource: &Resource,
    action: &Action,
    amount: Option<Decimal>,
    high_risk_amount: u64,
) -> RiskLevel {
    let score = action_severity(action) * resource_sensitivity(resource);
    let base = if score <= 2 {
        RiskLevel::Low
    } else if score <= 4 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    };

    match amount {
        Some(amount) if amount >= Decimal::from(high_risk_amount) => base.escalated(),
        _ => base,
    }
}

/// Request-scoped facts an authorization check may weigh.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub origin_address: Option<String>,
    pub amount: Option<Decimal>,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessDecision {
    pub granted: bool,
    pub user_id: Uuid,
    pub resource: Resource,
    pub action: Action,
    pub reason: String,
    pub risk_level: RiskLevel,
    pub checked_at: DateTime<Utc>,
}

/// Durable storage backend for roles and assignments.
#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn get_role(&self, name: &str) -> Result<Option<Role>>;

    async fn list_roles(&self) -> Result<Vec<Role>>;

    /// Insert or fully replace a role and its permission set.
    async fn upsert_role(&self, role: &Role) -> Result<()>;

    /// Remove a role; true when something was deleted.
    async fn delete_role(&self, name: &str) -> Result<bool>;

    async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<()>;

    /// Remove an assignment; true when the user held the role.
    async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> Result<bool>;

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<String>>;
}

/// In-memory role store for tests and single-node development.
#[derive(Default)]
pub struct MemoryRoleStore {
    roles: RwLock<HashMap<String, Role>>,
    assignments: RwLock<HashMap<Uuid, Vec<String>>>,
}

impl MemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleStore for MemoryRoleStore {
    async fn get_role(&self, name: &str) -> Result<Option<Role>> {
        Ok(self.roles.read().await.get(name).cloned())
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        Ok(self.roles.read().await.values().cloned().collect())
    }

    async fn upsert_role(&self, role: &Role) -> Result<()> {
        self.roles
            .write()
            .await
            .insert(role.name.clone(), role.clone());
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<bool> {
        Ok(self.roles.write().await.remove(name).is_some())
    }

    async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<()> {
        let mut assignments = self.assignments.write().await;
        let entry = assignments.entry(user_id).or_default();
        if !entry.iter().any(|name| name == role_name) {
            entry.push(role_name.to_string());
        }
        Ok(())
    }

    async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> Result<bool> {
        let mut assignments = self.assignments.write().await;
        match assignments.get_mut(&user_id) {
            Some(names) => {
                let before = names.len();
                names.retain(|name| name != role_name);
                Ok(names.len() < before)
            }
            None => Ok(false),
        }
    }

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<String>> {
        Ok(self
            .assignments
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Answers "does this user own that record". The concrete lookup lives in the
/// domain layer; authorization only needs the seam.
#[async_trait]
pub trait OwnershipResolver: Send + Sync {
    async fn owns(&self, user_id: Uuid, resource: &Resource, resource_id: &str) -> Result<bool>;
}

/// In-memory ownership table for tests.
#[derive(Default)]
pub struct MemoryOwnershipResolver {
    owned: RwLock<HashSet<(Uuid, String)>>,
}

impl MemoryOwnershipResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, user_id: Uuid, resource_id: &str) {
        self.owned
            .write()
            .await
            .insert((user_id, resource_id.to_string()));
    }
}

#[async_trait]
impl OwnershipResolver for MemoryOwnershipResolver {
    async fn owns(&self, user_id: Uuid, _resource: &Resource, resource_id: &str) -> Result<bool> {
        Ok(self
            .owned
            .read()
            .await
            .contains(&(user_id, resource_id.to_string())))
    }
}

fn permission_cache_key(user_id: Uuid) -> String {
    format!("rbac:user:{user_id}")
}

/// Collect all permissions for a set of roles, including inherited ones.
/// Safe against inheritance cycles.
fn collect_permissions(role_names: &[String], roles: &HashMap<String, Role>) -> Vec<Permission> {
    fn collect_recursive(
        role_name: &str,
        roles: &HashMap<String, Role>,
        permissions: &mut Vec<Permission>,
        visited: &mut HashSet<String>,
    ) {
        if !visited.insert(role_name.to_string()) {
            return;
        }

        if let Some(role) = roles.get(role_name) {
            permissions.extend(role.permissions.iter().cloned());
            for parent in &role.inherits {
                collect_recursive(parent, roles, permissions, visited);
            }
        }
    }

    let mut permissions = Vec::new();
    let mut visited = HashSet::new();
    for role_name in role_names {
        collect_recursive(role_name, roles, &mut permissions, &mut visited);
    }
    permissions
}

fn has_admin_equivalent(permissions: &[Permission], resource: &Resource) -> bool {
    permissions.iter().any(|permission| {
        permission.resource.matches(resource)
            && matches!(permission.action, Action::Manage | Action::All)
    })
}

enum ConditionCheck {
    Pass,
    OutsideWindow,
    OriginBlocked,
}

fn check_conditions(permission: &Permission, context: Option<&AccessContext>) -> ConditionCheck {
    let conditions = match &permission.conditions {
        Some(conditions) => conditions,
        None => return ConditionCheck::Pass,
    };

    if let Some(window) = &conditions.time_window {
        if !window.is_active() {
            return ConditionCheck::OutsideWindow;
        }
    }

    if let Some(allowed) = &conditions.origin_allow_list {
        let origin = context.and_then(|context| context.origin_address.as_deref());
        match origin {
            Some(origin) if allowed.iter().any(|entry| entry == origin) => {}
            _ => return ConditionCheck::OriginBlocked,
        }
    }

    ConditionCheck::Pass
}

/// Permission checking over the durable role store with a per-user cache.
pub struct RbacEngine {
    roles: Arc<dyn RoleStore>,
    ownership: Arc<dyn OwnershipResolver>,
    cache: Arc<dyn Cache>,
    config: RbacConfig,
    timeouts: TimeoutConfig,
}

impl RbacEngine {
    pub fn new(
        roles: Arc<dyn RoleStore>,
        ownership: Arc<dyn OwnershipResolver>,
        cache: Arc<dyn Cache>,
        config: RbacConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            roles,
            ownership,
            cache,
            config,
            timeouts,
        }
    }

    async fn bounded_cache<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(Duration::from_millis(self.timeouts.cache_op_ms), op).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientStore {
                message: format!("cache operation timed out after {}ms", self.timeouts.cache_op_ms),
            }),
        }
    }

    async fn bounded_store<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(Duration::from_millis(self.timeouts.store_op_ms), op).await {
            Ok(result) => result,
            Err(_) => Err(Error::TransientStore {
                message: format!("store operation timed out after {}ms", self.timeouts.store_op_ms),
            }),
        }
    }

    /// Insert the default roles that are not already present. Existing roles
    /// are left alone so administrator edits survive restarts.
    pub async fn seed_default_roles(&self) -> Result<()> {
        let mut seeded = 0u32;
        for role in DefaultRoles::all() {
            if self.bounded_store(self.roles.get_role(&role.name)).await?.is_none() {
                self.bounded_store(self.roles.upsert_role(&role)).await?;
                seeded += 1;
            }
        }
        if seeded > 0 {
            info!(count = seeded, "Seeded default roles");
        }
        Ok(())
    }

    /// Add a custom role.
    pub async fn create_role(&self, role: Role) -> Result<()> {
        if self.bounded_store(self.roles.get_role(&role.name)).await?.is_some() {
            return Err(Error::Config {
                message: format!("role {} already exists", role.name),
            });
        }
        self.bounded_store(self.roles.upsert_role(&role)).await?;
        info!(role = %role.name, "Created role");
        Ok(())
    }

    /// Replace an existing role. System roles cannot be modified.
    pub async fn update_role(&self, role: Role) -> Result<()> {
        if let Some(existing) = self.bounded_store(self.roles.get_role(&role.name)).await? {
            if existing.system_role {
                return Err(Error::Config {
                    message: format!("system role {} cannot be modified", role.name),
                });
            }
        }
        self.bounded_store(self.roles.upsert_role(&role)).await
    }

    /// Delete a role. System roles cannot be deleted.
    pub async fn delete_role(&self, name: &str) -> Result<bool> {
        if let Some(existing) = self.bounded_store(self.roles.get_role(name)).await? {
            if existing.system_role {
                return Err(Error::Config {
                    message: format!("system role {name} cannot be deleted"),
                });
            }
        }
        self.bounded_store(self.roles.delete_role(name)).await
    }

    /// Get a role by name.
    pub async fn get_role(&self, name: &str) -> Result<Option<Role>> {
        self.bounded_store(self.roles.get_role(name)).await
    }

    /// List all roles.
    pub async fn list_roles(&self) -> Result<Vec<Role>> {
        self.bounded_store(self.roles.list_roles()).await
    }

    /// Add a permission to a role. Users holding the role pick it up when
    /// their cached permission set expires.
    pub async fn grant(&self, role_name: &str, permission: Permission) -> Result<()> {
        let mut role = match self.bounded_store(self.roles.get_role(role_name)).await? {
            Some(role) => role,
            None => {
                return Err(Error::Config {
                    message: format!("role {role_name} does not exist"),
                })
            }
        };
        if role.system_role {
            return Err(Error::Config {
                message: format!("system role {role_name} cannot be modified"),
            });
        }

        role.add_permission(permission);
        self.bounded_store(self.roles.upsert_role(&role)).await?;
        info!(role = %role_name, "Granted permission to role");
        Ok(())
    }

    /// Assign a role to a user and invalidate their cached permissions.
    pub async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<()> {
        if self.bounded_store(self.roles.get_role(role_name)).await?.is_none() {
            return Err(Error::Config {
                message: format!("role {role_name} does not exist"),
            });
        }

        self.bounded_store(self.roles.assign_role(user_id, role_name))
            .await?;
        self.invalidate_permissions(user_id).await;
        info!(user_id = %user_id, role = %role_name, "Assigned role");
        Ok(())
    }

    /// Remove a role from a user and invalidate their cached permissions.
    pub async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> Result<bool> {
        let removed = self
            .bounded_store(self.roles.revoke_role(user_id, role_name))
            .await?;
        self.invalidate_permissions(user_id).await;
        if removed {
            info!(user_id = %user_id, role = %role_name, "Revoked role");
        }
        Ok(removed)
    }

    /// Get all roles assigned to a user.
    pub async fn roles_for(&self, user_id: Uuid) -> Result<Vec<String>> {
        self.bounded_store(self.roles.roles_for_user(user_id)).await
    }

    /// Drop a user's cached permission set. A failed delete only means the
    /// stale entry lives until its TTL, but it is worth a security warning.
    pub async fn invalidate_permissions(&self, user_id: Uuid) {
        let key = permission_cache_key(user_id);
        if let Err(error) = self.bounded_cache(self.cache.delete(&key)).await {
            warn!(
                security = true,
                user_id = %user_id,
                error = %error,
                "Failed to invalidate cached permissions; stale grants possible until TTL"
            );
        }
    }

    /// Resolve the user's flattened permission set, serving from the cache
    /// when possible. A cache failure falls through to the role store; a role
    /// store failure propagates, since guessing at permissions is not safe.
    pub async fn effective_permissions(&self, user_id: Uuid) -> Result<Vec<Permission>> {
        let key = permission_cache_key(user_id);
        match self
            .bounded_cache(get_json::<Vec<Permission>>(self.cache.as_ref(), &key))
            .await
        {
            Ok(Some(cached)) => return Ok(cached),
            Ok(None) => {}
            Err(error) => {
                warn!(error = %error, "Permission cache read failed, resolving from the role store");
            }
        }

        let role_names = self.bounded_store(self.roles.roles_for_user(user_id)).await?;
        let roles = self.bounded_store(self.roles.list_roles()).await?;
        let by_name: HashMap<String, Role> = roles
            .into_iter()
            .map(|role| (role.name.clone(), role))
            .collect();
        let permissions = collect_permissions(&role_names, &by_name);

        let ttl = Duration::from_secs(self.config.permission_cache_ttl_secs);
        if let Err(error) = self
            .bounded_cache(set_json(self.cache.as_ref(), &key, &permissions, Some(ttl)))
            .await
        {
            warn!(error = %error, "Permission cache write failed");
        }

        Ok(permissions)
    }

    /// Check whether a user may perform an action on a resource.
    ///
    /// Order: permission present, then ownership for identified records,
    /// then permission conditions, then the amount ceiling across roles.
    /// The returned risk label describes the request itself and is attached
    /// to denials as well as grants.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        resource: &Resource,
        action: &Action,
        resource_id: Option<&str>,
        context: Option<&AccessContext>,
    ) -> Result<AccessDecision> {
        let permissions = self.effective_permissions(user_id).await?;
        let amount = context.and_then(|context| context.amount);
        let risk = risk_label(resource, action, amount, self.config.high_risk_amount);

        let matching: Vec<&Permission> = permissions
            .iter()
            .filter(|permission| permission.grants(resource, action))
            .collect();
        if matching.is_empty() {
            return Ok(self.decision(
                false,
                user_id,
                resource,
                action,
                risk,
                "no permission for this action",
            ));
        }

        // Ownership applies only when a concrete record is named.
        let target_id = resource_id.or(match resource {
            Resource::Specific { resource_id, .. } => Some(resource_id.as_str()),
            _ => None,
        });
        if resource.requires_ownership() {
            if let Some(target) = target_id {
                if !has_admin_equivalent(&permissions, resource)
                    && !self
                        .bounded_store(self.ownership.owns(user_id, resource, target))
                        .await?
                {
                    return Ok(self.decision(
                        false,
                        user_id,
                        resource,
                        action,
                        risk,
                        "not the resource owner",
                    ));
                }
            }
        }

        let mut survivors: Vec<&Permission> = Vec::new();
        let mut window_blocked = false;
        for permission in &matching {
            match check_conditions(permission, context) {
                ConditionCheck::Pass => survivors.push(permission),
                ConditionCheck::OutsideWindow => window_blocked = true,
                ConditionCheck::OriginBlocked => {}
            }
        }
        if survivors.is_empty() {
            let reason = if window_blocked {
                "outside the permitted time window"
            } else {
                "origin address not permitted"
            };
            return Ok(self.decision(false, user_id, resource, action, risk, reason));
        }

        if let Some(amount) = amount {
            let mut ceiling: Option<Decimal> = None;
            let mut unlimited = false;
            for permission in &survivors {
                match permission
                    .conditions
                    .as_ref()
                    .and_then(|conditions| conditions.max_amount)
                {
                    None => {
                        unlimited = true;
                        break;
                    }
                    Some(max) => {
                        ceiling = Some(ceiling.map_or(max, |current| current.max(max)));
                    }
                }
            }
            if !unlimited {
                if let Some(ceiling) = ceiling {
                    if amount > ceiling {
                        return Ok(self.decision(
                            false,
                            user_id,
                            resource,
                            action,
                            risk,
                            "amount exceeds the role ceiling",
                        ));
                    }
                }
            }
        }

        Ok(self.decision(true, user_id, resource, action, risk, "granted"))
    }

    fn decision(
        &self,
        granted: bool,
        user_id: Uuid,
        resource: &Resource,
        action: &Action,
        risk_level: RiskLevel,
        reason: &str,
    ) -> AccessDecision {
        if granted {
            debug!(
                user_id = %user_id,
                resource = ?resource,
                action = ?action,
                risk = risk_level.as_str(),
                "Access granted"
            );
        } else {
            warn!(
                security = true,
                user_id = %user_id,
                resource = ?resource,
                action = ?action,
                risk = risk_level.as_str(),
                reason = reason,
                "Access denied"
            );
        }

        AccessDecision {
            granted,
            user_id,
            resource: resource.clone(),
            action: *action,
            reason: reason.to_string(),
            risk_level,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_core::cache::MemoryCache;
    use chrono::TimeZone;

    async fn engine() -> (
        RbacEngine,
        Arc<MemoryRoleStore>,
        Arc<MemoryOwnershipResolver>,
    ) {
        let roles = Arc::new(MemoryRoleStore::new());
        let ownership = Arc::new(MemoryOwnershipResolver::new());
        let cache = Arc::new(MemoryCache::new());
        let engine = RbacEngine::new(
            roles.clone(),
            ownership.clone(),
            cache,
            RbacConfig::default(),
            TimeoutConfig::default(),
        );
        engine.seed_default_roles().await.unwrap();
        (engine, roles, ownership)
    }

    fn window_containing_now() -> TimeWindow {
        let hour = Utc::now().time().hour() as u8;
        TimeWindow {
            start_hour: hour,
            end_hour: (hour + 1) % 24,
            allowed_days: None,
        }
    }

    fn window_excluding_now() -> TimeWindow {
        let hour = Utc::now().time().hour() as u8;
        TimeWindow {
            start_hour: (hour + 1) % 24,
            end_hour: (hour + 2) % 24,
            allowed_days: None,
        }
    }

    #[tokio::test]
    async fn test_default_roles() {
        let viewer = DefaultRoles::viewer();
        assert!(viewer.system_role);
        assert!(viewer.permissions.iter().all(|p| p.action == Action::Read));

        let operator = DefaultRoles::operator();
        assert!(operator.inherits.contains(&"viewer".to_string()));

        let admin = DefaultRoles::admin();
        assert!(admin.permissions.iter().any(|p| p.action == Action::All));
    }

    #[tokio::test]
    async fn test_permission_grants() {
        let perm = Permission::new(Resource::Account, Action::Read);
        assert!(perm.grants(&Resource::Account, &Action::Read));
        assert!(!perm.grants(&Resource::Account, &Action::Create));
        assert!(!perm.grants(&Resource::Portfolio, &Action::Read));

        let all_perm = Permission::new(Resource::All, Action::All);
        assert!(all_perm.grants(&Resource::Account, &Action::Create));
        assert!(all_perm.grants(&Resource::Transaction, &Action::Delete));
    }

    #[test]
    fn test_resource_matching() {
        assert!(Resource::All.matches(&Resource::Account));
        assert!(Resource::Account.matches(&Resource::All));
        assert!(Resource::Account.matches(&Resource::Account));
        assert!(!Resource::Account.matches(&Resource::Portfolio));

        let specific1 = Resource::specific("account", "123");
        let specific2 = Resource::specific("account", "456");
        assert!(specific1.matches(&specific2)); // Same type
    }

    #[test]
    fn test_ownership_gating_by_type() {
        assert!(Resource::Account.requires_ownership());
        assert!(Resource::Portfolio.requires_ownership());
        assert!(Resource::specific("portfolio", "p-1").requires_ownership());
        assert!(!Resource::Report.requires_ownership());
        assert!(!Resource::specific("report", "r-1").requires_ownership());
    }

    #[test]
    fn test_time_window() {
        let business_hours = TimeWindow {
            start_hour: 9,
            end_hour: 17,
            allowed_days: Some(vec![1, 2, 3, 4, 5]), // Mon-Fri
        };

        // 2026-01-07 is a Wednesday, 2026-01-10 a Saturday.
        let wednesday_morning = Utc.with_ymd_and_hms(2026, 1, 7, 10, 0, 0).unwrap();
        let wednesday_evening = Utc.with_ymd_and_hms(2026, 1, 7, 18, 0, 0).unwrap();
        let saturday_morning = Utc.with_ymd_and_hms(2026, 1, 10, 10, 0, 0).unwrap();
        assert!(business_hours.is_active_at(wednesday_morning));
        assert!(!business_hours.is_active_at(wednesday_evening));
        assert!(!business_hours.is_active_at(saturday_morning));

        let night_shift = TimeWindow {
            start_hour: 22,
            end_hour: 6,
            allowed_days: None,
        };
        let late_night = Utc.with_ymd_and_hms(2026, 1, 7, 23, 0, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2026, 1, 7, 12, 0, 0).unwrap();
        assert!(night_shift.is_active_at(late_night));
        assert!(!night_shift.is_active_at(midday));
    }

    #[test]
    fn test_risk_label() {
        assert_eq!(
            risk_label(&Resource::Report, &Action::Read, None, 10_000),
            RiskLevel::Low
        );
        assert_eq!(
            risk_label(&Resource::Account, &Action::Create, None, 10_000),
            RiskLevel::Medium
        );
        assert_eq!(
            risk_label(&Resource::Transaction, &Action::Transfer, None, 10_000),
            RiskLevel::High
        );

        // A large amount escalates one step.
        assert_eq!(
            risk_label(
                &Resource::Report,
                &Action::Read,
                Some(Decimal::from(50_000)),
                10_000
            ),
            RiskLevel::Medium
        );
        assert_eq!(
            risk_label(
                &Resource::Report,
                &Action::Read,
                Some(Decimal::from(500)),
                10_000
            ),
            RiskLevel::Low
        );
    }

    #[tokio::test]
    async fn test_assign_and_authorize() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();

        engine.assign_role(user, "viewer").await.unwrap();

        let read = engine
            .authorize(user, &Resource::Account, &Action::Read, None, None)
            .await
            .unwrap();
        assert!(read.granted);
        assert_eq!(read.reason, "granted");

        let create = engine
            .authorize(user, &Resource::Account, &Action::Create, None, None)
            .await
            .unwrap();
        assert!(!create.granted);
        assert_eq!(create.reason, "no permission for this action");

        engine.assign_role(user, "operator").await.unwrap();
        let create = engine
            .authorize(user, &Resource::Account, &Action::Create, None, None)
            .await
            .unwrap();
        assert!(create.granted);
    }

    #[tokio::test]
    async fn test_role_inheritance() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();
        engine.assign_role(user, "treasurer").await.unwrap();

        // Two levels up the chain: treasurer -> operator -> viewer.
        let read = engine
            .authorize(user, &Resource::Transaction, &Action::Read, None, None)
            .await
            .unwrap();
        assert!(read.granted);

        let update = engine
            .authorize(user, &Resource::Portfolio, &Action::Update, None, None)
            .await
            .unwrap();
        assert!(update.granted);

        let approve = engine
            .authorize(user, &Resource::Transaction, &Action::Approve, None, None)
            .await
            .unwrap();
        assert!(approve.granted);

        let configure = engine
            .authorize(user, &Resource::SystemConfig, &Action::Configure, None, None)
            .await
            .unwrap();
        assert!(!configure.granted);
    }

    #[tokio::test]
    async fn test_custom_role() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();

        let mut custom = Role::new("analyst", "Report analysis");
        custom.add_permission(Permission::new(Resource::Report, Action::Read));
        engine.create_role(custom).await.unwrap();
        engine
            .grant(
                "analyst",
                Permission::new(Resource::Report, Action::Export),
            )
            .await
            .unwrap();
        engine.assign_role(user, "analyst").await.unwrap();

        let export = engine
            .authorize(user, &Resource::Report, &Action::Export, None, None)
            .await
            .unwrap();
        assert!(export.granted);

        let accounts = engine
            .authorize(user, &Resource::Account, &Action::Read, None, None)
            .await
            .unwrap();
        assert!(!accounts.granted);
    }

    #[tokio::test]
    async fn test_cannot_modify_system_role() {
        let (engine, _, _) = engine().await;

        let modified_viewer = Role::new("viewer", "Modified viewer");
        assert!(engine.update_role(modified_viewer).await.is_err());
        assert!(engine.delete_role("viewer").await.is_err());
        assert!(engine
            .grant("viewer", Permission::new(Resource::All, Action::All))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_roles_refused() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();

        assert!(engine
            .create_role(Role::new("viewer", "Duplicate"))
            .await
            .is_err());
        assert!(engine.assign_role(user, "phantom").await.is_err());
        assert!(engine
            .grant("phantom", Permission::new(Resource::Report, Action::Read))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ownership_rule() {
        let (engine, _, ownership) = engine().await;
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();
        let admin = Uuid::new_v4();

        engine.assign_role(owner, "operator").await.unwrap();
        engine.assign_role(intruder, "operator").await.unwrap();
        engine.assign_role(admin, "admin").await.unwrap();
        ownership.add(owner, "acc-1").await;

        let allowed = engine
            .authorize(owner, &Resource::Account, &Action::Read, Some("acc-1"), None)
            .await
            .unwrap();
        assert!(allowed.granted);

        let blocked = engine
            .authorize(
                intruder,
                &Resource::Account,
                &Action::Read,
                Some("acc-1"),
                None,
            )
            .await
            .unwrap();
        assert!(!blocked.granted);
        assert_eq!(blocked.reason, "not the resource owner");

        // Admin-equivalent permission bypasses ownership.
        let admin_read = engine
            .authorize(admin, &Resource::Account, &Action::Read, Some("acc-1"), None)
            .await
            .unwrap();
        assert!(admin_read.granted);

        // Without a record id there is nothing to own.
        let listing = engine
            .authorize(intruder, &Resource::Account, &Action::Read, None, None)
            .await
            .unwrap();
        assert!(listing.granted);
    }

    #[tokio::test]
    async fn test_specific_resource_carries_its_own_id() {
        let (engine, _, ownership) = engine().await;
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();

        let mut single = Role::new("single_account", "Access to one account record");
        single.add_permission(Permission::new(
            Resource::specific("account", "acc-9"),
            Action::Read,
        ));
        engine.create_role(single).await.unwrap();
        engine.assign_role(owner, "single_account").await.unwrap();
        engine.assign_role(intruder, "single_account").await.unwrap();
        ownership.add(owner, "acc-9").await;

        let target = Resource::specific("account", "acc-9");
        let allowed = engine
            .authorize(owner, &target, &Action::Read, None, None)
            .await
            .unwrap();
        assert!(allowed.granted);

        // The ownership check reads the id embedded in the resource.
        let blocked = engine
            .authorize(intruder, &target, &Action::Read, None, None)
            .await
            .unwrap();
        assert!(!blocked.granted);
        assert_eq!(blocked.reason, "not the resource owner");
    }

    #[tokio::test]
    async fn test_cache_invalidated_on_assignment_and_revocation() {
        let (engine, roles, _) = engine().await;
        let user = Uuid::new_v4();
        engine.assign_role(user, "viewer").await.unwrap();

        let before = engine
            .authorize(user, &Resource::Portfolio, &Action::Update, None, None)
            .await
            .unwrap();
        assert!(!before.granted);

        // Assignment through the engine takes effect immediately.
        engine.assign_role(user, "operator").await.unwrap();
        let after_assign = engine
            .authorize(user, &Resource::Portfolio, &Action::Update, None, None)
            .await
            .unwrap();
        assert!(after_assign.granted);

        // A mutation that bypasses the engine is masked by the cache.
        roles.revoke_role(user, "operator").await.unwrap();
        let stale = engine
            .authorize(user, &Resource::Portfolio, &Action::Update, None, None)
            .await
            .unwrap();
        assert!(stale.granted);

        // Revocation through the engine invalidates and denies again.
        engine.revoke_role(user, "operator").await.unwrap();
        let after_revoke = engine
            .authorize(user, &Resource::Portfolio, &Action::Update, None, None)
            .await
            .unwrap();
        assert!(!after_revoke.granted);
    }

    #[tokio::test]
    async fn test_amount_ceiling_is_max_across_roles() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();
        engine.assign_role(user, "operator").await.unwrap();

        let small = AccessContext {
            amount: Some(Decimal::from(5_000)),
            ..Default::default()
        };
        let within = engine
            .authorize(
                user,
                &Resource::Transaction,
                &Action::Transfer,
                None,
                Some(&small),
            )
            .await
            .unwrap();
        assert!(within.granted);

        let large = AccessContext {
            amount: Some(Decimal::from(20_000)),
            ..Default::default()
        };
        let over = engine
            .authorize(
                user,
                &Resource::Transaction,
                &Action::Transfer,
                None,
                Some(&large),
            )
            .await
            .unwrap();
        assert!(!over.granted);
        assert_eq!(over.reason, "amount exceeds the role ceiling");
        assert_eq!(over.risk_level, RiskLevel::High);

        // The treasurer grant has no ceiling, so the effective ceiling is gone.
        engine.assign_role(user, "treasurer").await.unwrap();
        let uncapped = engine
            .authorize(
                user,
                &Resource::Transaction,
                &Action::Transfer,
                None,
                Some(&large),
            )
            .await
            .unwrap();
        assert!(uncapped.granted);
    }

    #[tokio::test]
    async fn test_origin_allow_list_condition() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();

        let mut desk = Role::new("desk", "Branch desk access");
        desk.add_permission(
            Permission::new(Resource::Transaction, Action::Approve).with_conditions(
                PermissionConditions {
                    origin_allow_list: Some(vec!["10.1.1.1".to_string()]),
                    ..Default::default()
                },
            ),
        );
        engine.create_role(desk).await.unwrap();
        engine.assign_role(user, "desk").await.unwrap();

        let from_desk = AccessContext {
            origin_address: Some("10.1.1.1".to_string()),
            ..Default::default()
        };
        let allowed = engine
            .authorize(
                user,
                &Resource::Transaction,
                &Action::Approve,
                None,
                Some(&from_desk),
            )
            .await
            .unwrap();
        assert!(allowed.granted);

        let from_elsewhere = AccessContext {
            origin_address: Some("203.0.113.9".to_string()),
            ..Default::default()
        };
        let blocked = engine
            .authorize(
                user,
                &Resource::Transaction,
                &Action::Approve,
                None,
                Some(&from_elsewhere),
            )
            .await
            .unwrap();
        assert!(!blocked.granted);
        assert_eq!(blocked.reason, "origin address not permitted");

        // No origin in the context fails a restricted permission too.
        let anonymous = engine
            .authorize(user, &Resource::Transaction, &Action::Approve, None, None)
            .await
            .unwrap();
        assert!(!anonymous.granted);
    }

    #[tokio::test]
    async fn test_time_window_condition() {
        let (engine, _, _) = engine().await;
        let on_shift = Uuid::new_v4();
        let off_shift = Uuid::new_v4();

        let mut open = Role::new("open_desk", "Active this hour");
        open.add_permission(
            Permission::new(Resource::Report, Action::Export).with_conditions(
                PermissionConditions {
                    time_window: Some(window_containing_now()),
                    ..Default::default()
                },
            ),
        );
        let mut closed = Role::new("closed_desk", "Active some other hour");
        closed.add_permission(
            Permission::new(Resource::Report, Action::Export).with_conditions(
                PermissionConditions {
                    time_window: Some(window_excluding_now()),
                    ..Default::default()
                },
            ),
        );
        engine.create_role(open).await.unwrap();
        engine.create_role(closed).await.unwrap();
        engine.assign_role(on_shift, "open_desk").await.unwrap();
        engine.assign_role(off_shift, "closed_desk").await.unwrap();

        let allowed = engine
            .authorize(on_shift, &Resource::Report, &Action::Export, None, None)
            .await
            .unwrap();
        assert!(allowed.granted);

        let blocked = engine
            .authorize(off_shift, &Resource::Report, &Action::Export, None, None)
            .await
            .unwrap();
        assert!(!blocked.granted);
        assert_eq!(blocked.reason, "outside the permitted time window");
    }

    #[tokio::test]
    async fn test_inheritance_cycle_is_safe() {
        let (engine, roles, _) = engine().await;
        let user = Uuid::new_v4();

        let mut first = Role::new("first", "Cycle half one");
        first.inherit_from("second");
        first.add_permission(Permission::new(Resource::Report, Action::Read));
        let mut second = Role::new("second", "Cycle half two");
        second.inherit_from("first");

        roles.upsert_role(&first).await.unwrap();
        roles.upsert_role(&second).await.unwrap();
        engine.assign_role(user, "second").await.unwrap();

        let permissions = engine.effective_permissions(user).await.unwrap();
        assert!(permissions
            .iter()
            .any(|p| p.grants(&Resource::Report, &Action::Read)));
    }

    #[tokio::test]
    async fn test_seed_is_idempotent() {
        let (engine, _, _) = engine().await;
        engine.seed_default_roles().await.unwrap();

        let roles = engine.list_roles().await.unwrap();
        assert_eq!(roles.len(), DefaultRoles::all().len());
    }

    #[tokio::test]
    async fn test_revoke_unassigned_role_is_false() {
        let (engine, _, _) = engine().await;
        let user = Uuid::new_v4();
        assert!(!engine.revoke_role(user, "viewer").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_deduplicates_assignments() {
        let store = MemoryRoleStore::new();
        let user = Uuid::new_v4();
        store.upsert_role(&DefaultRoles::viewer()).await.unwrap();
        store.assign_role(user, "viewer").await.unwrap();
        store.assign_role(user, "viewer").await.unwrap();
        assert_eq!(store.roles_for_user(user).await.unwrap().len(), 1);
    }
}

//! Authorization layers consulted after a token is validated.
//!
//! Provides:
//! - Role-based access control over a durable role store, with per-user
//!   permission caching, ownership rules, and conditional permissions
//! - A risk label on every decision for the audit trail
//! - A fixed-rule attribute policy evaluator for the checks roles cannot
//!   express

pub mod abac;
pub mod rbac;
pub mod storage_pg;

pub use abac::{
    evaluate, ActionAttributes, EnvironmentAttributes, ResourceAttributes, SubjectAttributes,
};
pub use rbac::{
    risk_label, AccessContext, AccessDecision, Action, DefaultRoles, MemoryOwnershipResolver,
    MemoryRoleStore, OwnershipResolver, Permission, PermissionConditions, RbacEngine, Resource,
    RiskLevel, Role, RoleStore, TimeWindow,
};
pub use storage_pg::PostgresRoleStore;

//! PostgreSQL role store over the standard roles / permissions /
//! role_permissions / user_roles many-to-many.
//!
//! Resources, actions, and conditions are stored as their JSON encodings in
//! text columns; permission rows are shared across roles and deduplicated by
//! a unique index over the encoded triple.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use aegis_core::Result;

use crate::rbac::{Action, Permission, PermissionConditions, Resource, Role, RoleStore};

fn resource_to_string(resource: &Resource) -> Result<String> {
    Ok(serde_json::to_string(resource)?)
}

fn parse_resource(raw: &str) -> Result<Resource> {
    Ok(serde_json::from_str(raw)?)
}

fn action_to_string(action: &Action) -> Result<String> {
    Ok(serde_json::to_string(action)?)
}

fn parse_action(raw: &str) -> Result<Action> {
    Ok(serde_json::from_str(raw)?)
}

fn conditions_to_string(conditions: &Option<PermissionConditions>) -> Result<Option<String>> {
    match conditions {
        Some(conditions) => Ok(Some(serde_json::to_string(conditions)?)),
        None => Ok(None),
    }
}

fn parse_conditions(raw: Option<&str>) -> Result<Option<PermissionConditions>> {
    match raw {
        Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
        None => Ok(None),
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    name: String,
    description: String,
    inherits: Vec<String>,
    system_role: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RoleRow {
    fn into_role(self, permissions: HashSet<Permission>) -> Role {
        Role {
            name: self.name,
            description: self.description,
            permissions,
            inherits: self.inherits,
            system_role: self.system_role,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PermissionRow {
    role_name: String,
    resource: String,
    action: String,
    conditions: Option<String>,
}

impl PermissionRow {
    fn into_permission(self) -> Result<Permission> {
        Ok(Permission {
            resource: parse_resource(&self.resource)?,
            action: parse_action(&self.action)?,
            conditions: parse_conditions(self.conditions.as_deref())?,
        })
    }
}

/// PostgreSQL-backed role store.
pub struct PostgresRoleStore {
    pool: PgPool,
}

impl PostgresRoleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl RoleStore for PostgresRoleStore {
    async fn get_role(&self, name: &str) -> Result<Option<Role>> {
        let row = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT name, description, inherits, system_role, created_at, updated_at
            FROM roles
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let permission_rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT rp.role_name, p.resource, p.action, p.conditions
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_name = $1
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut permissions = HashSet::new();
        for permission_row in permission_rows {
            permissions.insert(permission_row.into_permission()?);
        }

        Ok(Some(row.into_role(permissions)))
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let role_rows = sqlx::query_as::<_, RoleRow>(
            r#"
            SELECT name, description, inherits, system_role, created_at, updated_at
            FROM roles
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let permission_rows = sqlx::query_as::<_, PermissionRow>(
            r#"
            SELECT rp.role_name, p.resource, p.action, p.conditions
            FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_role: HashMap<String, HashSet<Permission>> = HashMap::new();
        for permission_row in permission_rows {
            let role_name = permission_row.role_name.clone();
            by_role
                .entry(role_name)
                .or_default()
                .insert(permission_row.into_permission()?);
        }

        Ok(role_rows
            .into_iter()
            .map(|row| {
                let permissions = by_role.remove(&row.name).unwrap_or_default();
                row.into_role(permissions)
            })
            .collect())
    }

    async fn upsert_role(&self, role: &Role) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO roles (name, description, inherits, system_role, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE
            SET description = EXCLUDED.description,
                inherits = EXCLUDED.inherits,
                system_role = EXCLUDED.system_role,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&role.name)
        .bind(&role.description)
        .bind(&role.inherits)
        .bind(role.system_role)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM role_permissions
            WHERE role_name = $1
            "#,
        )
        .bind(&role.name)
        .execute(&mut *tx)
        .await?;

        for permission in &role.permissions {
            let resource = resource_to_string(&permission.resource)?;
            let action = action_to_string(&permission.action)?;
            let conditions = conditions_to_string(&permission.conditions)?;

            sqlx::query(
                r#"
                INSERT INTO permissions (resource, action, conditions)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&resource)
            .bind(&action)
            .bind(&conditions)
            .execute(&mut *tx)
            .await?;

            let (permission_id,): (i64,) = sqlx::query_as(
                r#"
                SELECT id FROM permissions
                WHERE resource = $1 AND action = $2 AND conditions IS NOT DISTINCT FROM $3
                "#,
            )
            .bind(&resource)
            .bind(&action)
            .bind(&conditions)
            .fetch_one(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO role_permissions (role_name, permission_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&role.name)
            .bind(permission_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_role(&self, name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM roles
            WHERE name = $1
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn assign_role(&self, user_id: Uuid, role_name: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role_name, assigned_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM user_roles
            WHERE user_id = $1 AND role_name = $2
            "#,
        )
        .bind(user_id)
        .bind(role_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT role_name
            FROM user_roles
            WHERE user_id = $1
            ORDER BY assigned_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

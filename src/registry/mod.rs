//! Permission metadata and role set-algebra.
//!
//! The registry itself is immutable after startup: it is compiled from KDL
//! policy files (see [`loader`]) and passed by reference to whoever needs a
//! requirement lookup. Role permission sets live in the database so that
//! assignments can reference them transactionally;
//! [`roles_for_all_permissions`] is the conjunctive query over that table.

pub mod loader;

use std::collections::{HashMap, HashSet};

use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};

use crate::entities::{role, role_permission};
use crate::errors::AclError;

/// Permission required to grant or revoke arbitrary roles at a node.
pub const GRANT_ROLES: &str = "grant_roles";
/// Permission required to share roles the granting principal already holds.
pub const SHARE_OWN_ROLES: &str = "share_own_roles";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionMeta {
    pub description: Option<String>,
    /// "entity_type:operation" pairs this permission protects.
    pub protects: Vec<String>,
}

#[derive(Debug, Default)]
pub struct Registry {
    permissions: HashMap<String, PermissionMeta>,
    /// (entity_type, operation) -> required permission set
    requirements: HashMap<(String, String), Vec<String>>,
    default_requirement: Vec<String>,
}

impl Registry {
    pub fn new(default_requirement: Vec<String>) -> Self {
        Self {
            default_requirement,
            ..Default::default()
        }
    }

    /// Idempotent; re-registering a name overwrites its metadata.
    pub fn register(&mut self, name: &str, meta: PermissionMeta) {
        self.permissions.insert(name.to_string(), meta);
    }

    pub fn get(&self, name: &str) -> Result<&PermissionMeta, AclError> {
        self.permissions
            .get(name)
            .ok_or_else(|| AclError::NotFound(format!("permission `{name}`")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.permissions.contains_key(name)
    }

    pub fn permission_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.permissions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn declare_requirement(
        &mut self,
        entity_type: &str,
        operation: &str,
        permissions: Vec<String>,
    ) {
        self.requirements
            .insert((entity_type.to_string(), operation.to_string()), permissions);
    }

    /// The permission set required for (entity type, operation), falling
    /// back to the configured default when nothing is declared.
    pub fn requirements_for(&self, entity_type: &str, operation: &str) -> Vec<String> {
        self.requirements
            .get(&(entity_type.to_string(), operation.to_string()))
            .cloned()
            .unwrap_or_else(|| self.default_requirement.clone())
    }

    pub fn default_requirement(&self) -> &[String] {
        &self.default_requirement
    }
}

/// Role ids whose permission set covers the whole required set.
///
/// Conjunctive semantics: a role counts only when it carries every required
/// permission, not just one of them. An empty requirement accepts all roles.
pub async fn roles_for_all_permissions<C, S>(
    conn: &C,
    permissions: &[S],
) -> Result<Vec<i32>, AclError>
where
    C: ConnectionTrait,
    S: AsRef<str>,
{
    let required: HashSet<String> = permissions
        .iter()
        .map(|p| p.as_ref().to_string())
        .collect();
    if required.is_empty() {
        return Ok(role::Entity::find()
            .all(conn)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect());
    }

    let rows = role_permission::Entity::find()
        .filter(
            role_permission::Column::Permission
                .is_in(required.iter().cloned().collect::<Vec<_>>()),
        )
        .all(conn)
        .await?;

    let mut matched: HashMap<i32, HashSet<String>> = HashMap::new();
    for row in rows {
        matched.entry(row.role_id).or_default().insert(row.permission);
    }
    let mut ids: Vec<i32> = matched
        .into_iter()
        .filter(|(_, held)| held.len() == required.len())
        .map(|(id, _)| id)
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

//! Principals, roles, and assignments.
//!
//! Assignments are the source of truth for grants; every mutation here runs
//! its propagation in the same transaction so the effective-assignment
//! cache never lags. Validation failures abort before anything is written.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, Set, TransactionTrait,
};

use crate::context::{AuthContext, ANONYMOUS_PRINCIPAL_ID, UNRESTRICTABLE_PRINCIPAL_ID};
use crate::entities::{assignment, effective_assignment, principal, role, role_permission};
use crate::errors::AclError;
use crate::graph::{self, GLOBAL_NODE_ID};
use crate::registry::{GRANT_ROLES, SHARE_OWN_ROLES};
use crate::{propagation, resolver};

pub async fn init(cfg: &crate::settings::Database) -> Result<DatabaseConnection, AclError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

/// Find or create the principal wrapping a subject.
pub async fn create_principal<C: ConnectionTrait>(
    conn: &C,
    subject_type: &str,
    subject_id: i64,
) -> Result<principal::Model, AclError> {
    if let Some(existing) = principal::Entity::find()
        .filter(principal::Column::SubjectType.eq(subject_type))
        .filter(principal::Column::SubjectId.eq(subject_id))
        .one(conn)
        .await?
    {
        return Ok(existing);
    }
    let model = principal::ActiveModel {
        subject_type: Set(subject_type.to_string()),
        subject_id: Set(subject_id),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    Ok(model)
}

pub async fn find_principal<C: ConnectionTrait>(
    conn: &C,
    principal_id: i32,
) -> Result<principal::Model, AclError> {
    principal::Entity::find_by_id(principal_id)
        .one(conn)
        .await?
        .ok_or_else(|| AclError::NotFound(format!("principal {principal_id}")))
}

/// Find or create a role. Existing roles keep their flags; use
/// [`crate::registry::loader::sync_roles`] to change them.
pub async fn create_role<C: ConnectionTrait>(
    conn: &C,
    name: &str,
    local: bool,
    global: bool,
) -> Result<role::Model, AclError> {
    if let Some(existing) = role::Entity::find()
        .filter(role::Column::Name.eq(name))
        .one(conn)
        .await?
    {
        return Ok(existing);
    }
    let model = role::ActiveModel {
        name: Set(name.to_string()),
        local: Set(local),
        global: Set(global),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    }
    .insert(conn)
    .await?;
    Ok(model)
}

pub async fn find_role<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
) -> Result<role::Model, AclError> {
    role::Entity::find_by_id(role_id)
        .one(conn)
        .await?
        .ok_or_else(|| AclError::NotFound(format!("role {role_id}")))
}

pub async fn find_role_by_name<C: ConnectionTrait>(
    conn: &C,
    name: &str,
) -> Result<role::Model, AclError> {
    role::Entity::find()
        .filter(role::Column::Name.eq(name))
        .one(conn)
        .await?
        .ok_or_else(|| AclError::NotFound(format!("role `{name}`")))
}

/// Replace a role's permission set.
pub async fn set_role_permissions<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
    permissions: &[String],
) -> Result<(), AclError> {
    find_role(conn, role_id).await?;
    role_permission::Entity::delete_many()
        .filter(role_permission::Column::RoleId.eq(role_id))
        .exec(conn)
        .await?;
    if permissions.is_empty() {
        return Ok(());
    }
    let models: Vec<role_permission::ActiveModel> = permissions
        .iter()
        .map(|perm| role_permission::ActiveModel {
            role_id: Set(role_id),
            permission: Set(perm.clone()),
        })
        .collect();
    role_permission::Entity::insert_many(models)
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

pub async fn permissions_of_role<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
) -> Result<Vec<String>, AclError> {
    let mut perms: Vec<String> = role_permission::Entity::find()
        .filter(role_permission::Column::RoleId.eq(role_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|rp| rp.permission)
        .collect();
    perms.sort_unstable();
    Ok(perms)
}

pub async fn assignments_at<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<Vec<assignment::Model>, AclError> {
    Ok(assignment::Entity::find()
        .filter(assignment::Column::NodeId.eq(node_id))
        .all(conn)
        .await?)
}

/// Whether any of `principals` effectively holds `role_id` at `node_id`
/// (inherited counts) or at the global node.
pub async fn has_effective_role<C: ConnectionTrait>(
    conn: &C,
    principals: &[i32],
    role_id: i32,
    node_id: i32,
) -> Result<bool, AclError> {
    if principals.is_empty() {
        return Ok(false);
    }
    let count = effective_assignment::Entity::find()
        .filter(effective_assignment::Column::RoleId.eq(role_id))
        .filter(effective_assignment::Column::PrincipalId.is_in(principals.to_vec()))
        .filter(
            effective_assignment::Column::NodeId.is_in(vec![node_id, GLOBAL_NODE_ID]),
        )
        .count(conn)
        .await?;
    Ok(count > 0)
}

/// The granting context must be trusted, hold `grant_roles` at the node, or
/// hold `share_own_roles` there together with the role being shared.
async fn verify_may_administer<C: ConnectionTrait>(
    conn: &C,
    ctx: &AuthContext,
    role_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    if ctx.is_unrestricted() {
        return Ok(());
    }
    if resolver::can(conn, ctx, &[GRANT_ROLES], node_id).await? {
        return Ok(());
    }
    if resolver::can(conn, ctx, &[SHARE_OWN_ROLES], node_id).await?
        && has_effective_role(conn, &ctx.principals, role_id, node_id).await?
    {
        return Ok(());
    }
    let held_roles = resolver::role_names_held(conn, &ctx.principals, node_id).await?;
    tracing::warn!(
        node = node_id,
        principals = ?ctx.principals,
        roles = ?held_roles,
        "role administration denied"
    );
    Err(AclError::Unauthorized {
        node: node_id,
        missing: vec![GRANT_ROLES.to_string()],
        held_roles,
    })
}

/// Grant `role_id` to `principal_id` at `node_id` and propagate it to the
/// block-respecting descendants. Granting an existing tuple is a no-op.
pub async fn grant(
    db: &DatabaseConnection,
    ctx: &AuthContext,
    role_id: i32,
    principal_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    let txn = db.begin().await?;
    grant_in(&txn, ctx, role_id, principal_id, node_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn grant_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &AuthContext,
    role_id: i32,
    principal_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    let node = graph::find_node(conn, node_id).await?;
    let role = find_role(conn, role_id).await?;
    find_principal(conn, principal_id).await?;

    let at_global = node.id == GLOBAL_NODE_ID;
    if (at_global && !role.global) || (!at_global && !role.local) {
        return Err(AclError::InvalidRoleAssignment {
            role: role.name,
            node: node_id,
        });
    }

    verify_may_administer(conn, ctx, role_id, node_id).await?;

    let existing = assignment::Entity::find()
        .filter(assignment::Column::RoleId.eq(role_id))
        .filter(assignment::Column::PrincipalId.eq(principal_id))
        .filter(assignment::Column::NodeId.eq(node_id))
        .one(conn)
        .await?;
    if existing.is_some() {
        return Ok(());
    }

    assignment::ActiveModel {
        role_id: Set(role_id),
        principal_id: Set(principal_id),
        node_id: Set(node_id),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    propagation::propagate_assignment(conn, role_id, principal_id, node_id).await?;

    tracing::info!(
        role = %role.name,
        principal = principal_id,
        node = node_id,
        "granted role"
    );
    Ok(())
}

/// Revoke an assignment and depropagate it. Effective tuples still
/// justified by another assignment of the same (role, principal) pair
/// survive untouched.
pub async fn revoke(
    db: &DatabaseConnection,
    ctx: &AuthContext,
    role_id: i32,
    principal_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    let txn = db.begin().await?;
    revoke_in(&txn, ctx, role_id, principal_id, node_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn revoke_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &AuthContext,
    role_id: i32,
    principal_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    graph::find_node(conn, node_id).await?;
    let role = find_role(conn, role_id).await?;

    verify_may_administer(conn, ctx, role_id, node_id).await?;

    let existing = assignment::Entity::find()
        .filter(assignment::Column::RoleId.eq(role_id))
        .filter(assignment::Column::PrincipalId.eq(principal_id))
        .filter(assignment::Column::NodeId.eq(node_id))
        .one(conn)
        .await?
        .ok_or_else(|| {
            AclError::NotFound(format!(
                "assignment of role `{}` to principal {principal_id} at node {node_id}",
                role.name
            ))
        })?;

    assignment::Entity::delete_by_id(existing.id)
        .exec(conn)
        .await?;

    propagation::depropagate_assignment(conn, role_id, principal_id, node_id).await?;

    tracing::info!(
        role = %role.name,
        principal = principal_id,
        node = node_id,
        "revoked role"
    );
    Ok(())
}

/// Destroy a role: every assignment of it is revoked (with depropagation)
/// before the role row and its permission set go away.
pub async fn destroy_role(db: &DatabaseConnection, role_id: i32) -> Result<(), AclError> {
    let txn = db.begin().await?;
    destroy_role_in(&txn, role_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn destroy_role_in<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
) -> Result<(), AclError> {
    let role = find_role(conn, role_id).await?;
    let rows = assignment::Entity::find()
        .filter(assignment::Column::RoleId.eq(role_id))
        .all(conn)
        .await?;
    for row in rows {
        assignment::Entity::delete_by_id(row.id).exec(conn).await?;
        propagation::depropagate_assignment(conn, row.role_id, row.principal_id, row.node_id)
            .await?;
    }
    role_permission::Entity::delete_many()
        .filter(role_permission::Column::RoleId.eq(role_id))
        .exec(conn)
        .await?;
    role::Entity::delete_by_id(role_id).exec(conn).await?;
    tracing::info!(role = %role.name, "destroyed role");
    Ok(())
}

/// Destroy a principal and every assignment it holds. The reserved
/// principals cannot be destroyed.
pub async fn destroy_principal(
    db: &DatabaseConnection,
    principal_id: i32,
) -> Result<(), AclError> {
    let txn = db.begin().await?;
    destroy_principal_in(&txn, principal_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn destroy_principal_in<C: ConnectionTrait>(
    conn: &C,
    principal_id: i32,
) -> Result<(), AclError> {
    if principal_id == ANONYMOUS_PRINCIPAL_ID || principal_id == UNRESTRICTABLE_PRINCIPAL_ID {
        return Err(AclError::InvalidPolicy(format!(
            "principal {principal_id} is reserved and cannot be destroyed"
        )));
    }
    let subject = find_principal(conn, principal_id).await?;
    let rows = assignment::Entity::find()
        .filter(assignment::Column::PrincipalId.eq(principal_id))
        .all(conn)
        .await?;
    for row in rows {
        assignment::Entity::delete_by_id(row.id).exec(conn).await?;
        propagation::depropagate_assignment(conn, row.role_id, row.principal_id, row.node_id)
            .await?;
    }
    principal::Entity::delete_by_id(principal_id).exec(conn).await?;
    tracing::info!(
        principal = principal_id,
        subject_type = %subject.subject_type,
        "destroyed principal"
    );
    Ok(())
}

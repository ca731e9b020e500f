//! Permission resolution and query restriction.
//!
//! `can` answers membership questions against the effective-assignment
//! materialization; `restriction` turns the same question into a single SQL
//! subquery usable as an `IN` predicate on a collection's id column. Reads
//! are lock-free.

use std::collections::HashSet;

use sea_orm::sea_query::{Expr, IntoColumnRef, Query, SelectStatement, SimpleExpr};
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter};

use crate::context::AuthContext;
use crate::entities::{effective_assignment, node, role, role_permission};
use crate::errors::AclError;
use crate::graph::GLOBAL_NODE_ID;
use crate::registry;

async fn has_effective<C: ConnectionTrait>(
    conn: &C,
    principals: &[i32],
    accepting_roles: &[i32],
    node_id: i32,
) -> Result<bool, AclError> {
    let count = effective_assignment::Entity::find()
        .filter(effective_assignment::Column::NodeId.eq(node_id))
        .filter(effective_assignment::Column::PrincipalId.is_in(principals.to_vec()))
        .filter(effective_assignment::Column::RoleId.is_in(accepting_roles.to_vec()))
        .count(conn)
        .await?;
    Ok(count > 0)
}

/// Whether any of the context principals may exercise the whole permission
/// set at `node_id`.
///
/// A role only counts when its permission set covers the entire required
/// set. The global node is checked first: a global grant overrides every
/// per-node decision. Trusted contexts and the unrestrictable principal
/// pass unconditionally.
pub async fn can<C, S>(
    conn: &C,
    ctx: &AuthContext,
    permissions: &[S],
    node_id: i32,
) -> Result<bool, AclError>
where
    C: ConnectionTrait,
    S: AsRef<str>,
{
    if ctx.is_unrestricted() {
        return Ok(true);
    }
    if ctx.principals.is_empty() {
        return Ok(false);
    }
    let accepting = registry::roles_for_all_permissions(conn, permissions).await?;
    if accepting.is_empty() {
        return Ok(false);
    }
    if has_effective(conn, &ctx.principals, &accepting, GLOBAL_NODE_ID).await? {
        return Ok(true);
    }
    if node_id != GLOBAL_NODE_ID {
        return has_effective(conn, &ctx.principals, &accepting, node_id).await;
    }
    Ok(false)
}

/// Like [`can`], but failure is an [`AclError::Unauthorized`] carrying what
/// was missing, what the principals actually hold at the examined nodes,
/// and a logged diagnostic for audit purposes.
pub async fn verify<C, S>(
    conn: &C,
    ctx: &AuthContext,
    permissions: &[S],
    node_id: i32,
) -> Result<(), AclError>
where
    C: ConnectionTrait,
    S: AsRef<str>,
{
    if can(conn, ctx, permissions, node_id).await? {
        return Ok(());
    }

    let role_ids = effective_role_ids(conn, &ctx.principals, node_id).await?;
    let held_roles = names_of_roles(conn, &role_ids).await?;
    let held_permissions: HashSet<String> = role_permission::Entity::find()
        .filter(role_permission::Column::RoleId.is_in(role_ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|rp| rp.permission)
        .collect();

    let mut missing: Vec<String> = permissions
        .iter()
        .map(|p| p.as_ref().to_string())
        .filter(|p| !held_permissions.contains(p))
        .collect();
    missing.sort_unstable();
    missing.dedup();
    if missing.is_empty() {
        // Every permission is held, but scattered across roles: no single
        // role covers the conjunction. Report the whole required set.
        missing = permissions.iter().map(|p| p.as_ref().to_string()).collect();
        missing.sort_unstable();
        missing.dedup();
    }

    tracing::warn!(
        node = node_id,
        principals = ?ctx.principals,
        ?missing,
        roles = ?held_roles,
        "permission check failed"
    );
    Err(AclError::Unauthorized {
        node: node_id,
        missing,
        held_roles,
    })
}

/// Role ids effectively assigned to `principals` at `node_id` or globally.
async fn effective_role_ids<C: ConnectionTrait>(
    conn: &C,
    principals: &[i32],
    node_id: i32,
) -> Result<Vec<i32>, AclError> {
    if principals.is_empty() {
        return Ok(Vec::new());
    }
    let ids: HashSet<i32> = effective_assignment::Entity::find()
        .filter(effective_assignment::Column::PrincipalId.is_in(principals.to_vec()))
        .filter(
            effective_assignment::Column::NodeId.is_in(vec![node_id, GLOBAL_NODE_ID]),
        )
        .all(conn)
        .await?
        .into_iter()
        .map(|ea| ea.role_id)
        .collect();
    Ok(ids.into_iter().collect())
}

async fn names_of_roles<C: ConnectionTrait>(
    conn: &C,
    role_ids: &[i32],
) -> Result<Vec<String>, AclError> {
    if role_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = role::Entity::find()
        .filter(role::Column::Id.is_in(role_ids.to_vec()))
        .all(conn)
        .await?
        .into_iter()
        .map(|r| r.name)
        .collect();
    names.sort_unstable();
    Ok(names)
}

/// Names of the roles `principals` effectively hold at `node_id` or
/// globally; used for denial diagnostics.
pub(crate) async fn role_names_held<C: ConnectionTrait>(
    conn: &C,
    principals: &[i32],
    node_id: i32,
) -> Result<Vec<String>, AclError> {
    let ids = effective_role_ids(conn, principals, node_id).await?;
    names_of_roles(conn, &ids).await
}

/// A reusable row filter for collection queries over one securable type.
#[derive(Debug, Clone)]
pub enum Restriction {
    /// Globally permitted: pass every row through.
    Unrestricted,
    /// No accepting role or no accepting node: match nothing.
    DenyAll,
    /// Restrict to securable ids drawn from a single subquery over the
    /// effective-assignment index; the id list is never materialized here.
    SecurableIds(SelectStatement),
}

impl Restriction {
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Restriction::Unrestricted)
    }

    pub fn is_deny_all(&self) -> bool {
        matches!(self, Restriction::DenyAll)
    }

    /// Render as a predicate on the collection's id column, suitable for a
    /// `filter` clause in the consuming data layer.
    pub fn to_expr<T: IntoColumnRef>(&self, id_column: T) -> SimpleExpr {
        match self {
            Restriction::Unrestricted => Expr::value(true),
            Restriction::DenyAll => Expr::value(false),
            Restriction::SecurableIds(query) => {
                Expr::col(id_column).in_subquery(query.clone())
            }
        }
    }
}

/// Build the restriction predicate for listing entities of `entity_type`
/// under the given required permission set.
pub async fn restriction<C, S>(
    conn: &C,
    ctx: &AuthContext,
    entity_type: &str,
    permissions: &[S],
) -> Result<Restriction, AclError>
where
    C: ConnectionTrait,
    S: AsRef<str>,
{
    if ctx.is_unrestricted() {
        return Ok(Restriction::Unrestricted);
    }
    if ctx.principals.is_empty() {
        return Ok(Restriction::DenyAll);
    }
    let accepting = registry::roles_for_all_permissions(conn, permissions).await?;
    if accepting.is_empty() {
        return Ok(Restriction::DenyAll);
    }
    if has_effective(conn, &ctx.principals, &accepting, GLOBAL_NODE_ID).await? {
        return Ok(Restriction::Unrestricted);
    }

    // Accepting-node set empty means "no rows", never "unrestricted".
    let any = effective_assignment::Entity::find()
        .filter(effective_assignment::Column::PrincipalId.is_in(ctx.principals.clone()))
        .filter(effective_assignment::Column::RoleId.is_in(accepting.clone()))
        .count(conn)
        .await?;
    if any == 0 {
        return Ok(Restriction::DenyAll);
    }

    let mut query = Query::select();
    query
        .column((node::Entity, node::Column::SecurableId))
        .distinct()
        .from(effective_assignment::Entity)
        .inner_join(
            node::Entity,
            Expr::col((node::Entity, node::Column::Id)).equals((
                effective_assignment::Entity,
                effective_assignment::Column::NodeId,
            )),
        )
        .and_where(Expr::col((node::Entity, node::Column::SecurableType)).eq(entity_type))
        .and_where(
            Expr::col((
                effective_assignment::Entity,
                effective_assignment::Column::PrincipalId,
            ))
            .is_in(ctx.principals.clone()),
        )
        .and_where(
            Expr::col((
                effective_assignment::Entity,
                effective_assignment::Column::RoleId,
            ))
            .is_in(accepting),
        );
    Ok(Restriction::SecurableIds(query))
}

/// The node set visible to the context under the required permission set:
/// the inspection counterpart of [`restriction`]. Unrestricted contexts and
/// global grants see every node.
pub async fn accessible_node_ids<C, S>(
    conn: &C,
    ctx: &AuthContext,
    permissions: &[S],
) -> Result<HashSet<i32>, AclError>
where
    C: ConnectionTrait,
    S: AsRef<str>,
{
    if ctx.is_unrestricted() {
        return all_node_ids(conn).await;
    }
    if ctx.principals.is_empty() {
        return Ok(HashSet::new());
    }
    let accepting = registry::roles_for_all_permissions(conn, permissions).await?;
    if accepting.is_empty() {
        return Ok(HashSet::new());
    }
    if has_effective(conn, &ctx.principals, &accepting, GLOBAL_NODE_ID).await? {
        return all_node_ids(conn).await;
    }
    Ok(effective_assignment::Entity::find()
        .filter(effective_assignment::Column::PrincipalId.is_in(ctx.principals.clone()))
        .filter(effective_assignment::Column::RoleId.is_in(accepting))
        .all(conn)
        .await?
        .into_iter()
        .map(|ea| ea.node_id)
        .collect())
}

async fn all_node_ids<C: ConnectionTrait>(conn: &C) -> Result<HashSet<i32>, AclError> {
    Ok(node::Entity::find()
        .all(conn)
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect())
}

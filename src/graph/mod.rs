//! Node graph: securable nodes, parent/child edges, reachability queries.
//!
//! Edges are the inheritance paths for permissions. Structural invariants
//! (acyclicity, global-node rules) are checked before anything is persisted;
//! every mutation triggers the propagation hooks that keep the
//! `effective_assignments` materialization consistent within the same
//! transaction.

pub mod closure;

use std::collections::HashSet;

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QuerySelect, Set, TransactionTrait,
};

use crate::context::AuthContext;
use crate::entities::{assignment, edge, effective_assignment, node};
use crate::errors::AclError;
use crate::{propagation, store};

/// Seeded by the initial migration; implicit ancestor of every node.
pub const GLOBAL_NODE_ID: i32 = 1;
pub const GLOBAL_SECURABLE_TYPE: &str = "global";

pub async fn find_node<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<node::Model, AclError> {
    node::Entity::find_by_id(node_id)
        .one(conn)
        .await?
        .ok_or_else(|| AclError::NotFound(format!("node {node_id}")))
}

pub async fn node_for_securable<C: ConnectionTrait>(
    conn: &C,
    securable_type: &str,
    securable_id: i64,
) -> Result<Option<node::Model>, AclError> {
    Ok(node::Entity::find()
        .filter(node::Column::SecurableType.eq(securable_type))
        .filter(node::Column::SecurableId.eq(securable_id))
        .one(conn)
        .await?)
}

pub async fn parents_of<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<Vec<i32>, AclError> {
    Ok(edge::Entity::find()
        .filter(edge::Column::ChildId.eq(node_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|e| e.parent_id)
        .collect())
}

pub async fn children_of<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<Vec<i32>, AclError> {
    Ok(edge::Entity::find()
        .filter(edge::Column::ParentId.eq(node_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|e| e.child_id)
        .collect())
}

/// One BFS step: all neighbors of `frontier` in the given direction.
async fn expand_frontier<C: ConnectionTrait>(
    conn: &C,
    frontier: &[i32],
    down: bool,
) -> Result<Vec<i32>, AclError> {
    let rows = if down {
        edge::Entity::find()
            .filter(edge::Column::ParentId.is_in(frontier.to_vec()))
            .all(conn)
            .await?
    } else {
        edge::Entity::find()
            .filter(edge::Column::ChildId.is_in(frontier.to_vec()))
            .all(conn)
            .await?
    };
    Ok(rows
        .into_iter()
        .map(|e| if down { e.child_id } else { e.parent_id })
        .collect())
}

async fn unblocked_subset<C: ConnectionTrait>(
    conn: &C,
    ids: Vec<i32>,
) -> Result<Vec<i32>, AclError> {
    if ids.is_empty() {
        return Ok(ids);
    }
    Ok(node::Entity::find()
        .filter(node::Column::Id.is_in(ids))
        .filter(node::Column::Blocked.eq(false))
        .all(conn)
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect())
}

/// Full structural ancestor closure of `node_id`, the node itself excluded.
/// Blocking is ignored here; use [`reaching`] for the permission-bearing set.
pub async fn ancestors_of<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<HashSet<i32>, AclError> {
    find_node(conn, node_id).await?;
    let mut visited = HashSet::from([node_id]);
    let mut frontier = vec![node_id];
    while !frontier.is_empty() {
        let next = expand_frontier(conn, &frontier, false).await?;
        frontier = next.into_iter().filter(|id| visited.insert(*id)).collect();
    }
    visited.remove(&node_id);
    Ok(visited)
}

/// Full structural descendant closure of `node_id`, the node itself excluded.
pub async fn descendants_of<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<HashSet<i32>, AclError> {
    find_node(conn, node_id).await?;
    let mut visited = HashSet::from([node_id]);
    let mut frontier = vec![node_id];
    while !frontier.is_empty() {
        let next = expand_frontier(conn, &frontier, true).await?;
        frontier = next.into_iter().filter(|id| visited.insert(*id)).collect();
    }
    visited.remove(&node_id);
    Ok(visited)
}

/// The block-respecting down-set of `node_id` (itself included): exactly the
/// nodes an assignment at `node_id` takes effect on. Traversal never
/// descends into a blocked child.
pub async fn reachable_from<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<HashSet<i32>, AclError> {
    find_node(conn, node_id).await?;
    let mut visited = HashSet::from([node_id]);
    let mut frontier = vec![node_id];
    while !frontier.is_empty() {
        let next = expand_frontier(conn, &frontier, true).await?;
        let fresh: Vec<i32> = next
            .into_iter()
            .filter(|id| !visited.contains(id))
            .collect();
        let unblocked = unblocked_subset(conn, fresh).await?;
        frontier = unblocked
            .into_iter()
            .filter(|id| visited.insert(*id))
            .collect();
    }
    Ok(visited)
}

/// The block-respecting up-set of `node_id` (itself included): exactly the
/// nodes whose assignments reach `node_id`. A blocked node is reached by
/// nothing above it; ascent continues past a parent only while that parent
/// is itself unblocked.
pub async fn reaching<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<HashSet<i32>, AclError> {
    let start = find_node(conn, node_id).await?;
    let mut visited = HashSet::from([node_id]);
    if start.blocked {
        return Ok(visited);
    }
    let mut frontier = vec![node_id];
    while !frontier.is_empty() {
        let next = expand_frontier(conn, &frontier, false).await?;
        let fresh: Vec<i32> = next.into_iter().filter(|id| visited.insert(*id)).collect();
        frontier = unblocked_subset(conn, fresh).await?;
    }
    Ok(visited)
}

/// Row-lock every node whose effective assignments are about to be
/// recomputed, so concurrent edge changes on overlapping lineages serialize.
pub(crate) async fn lock_nodes<C: ConnectionTrait>(
    conn: &C,
    ids: &HashSet<i32>,
) -> Result<(), AclError> {
    if ids.is_empty() {
        return Ok(());
    }
    node::Entity::find()
        .filter(node::Column::Id.is_in(ids.iter().copied().collect::<Vec<_>>()))
        .lock_exclusive()
        .all(conn)
        .await?;
    Ok(())
}

async fn insert_edge<C: ConnectionTrait>(
    conn: &C,
    parent_id: i32,
    child_id: i32,
) -> Result<(), AclError> {
    edge::Entity::insert(edge::ActiveModel {
        parent_id: Set(parent_id),
        child_id: Set(child_id),
    })
    .exec_without_returning(conn)
    .await?;
    Ok(())
}

/// Create a node for a securable, attach its parents (the global node when
/// none are declared), and grant the configured default roles to the
/// context principals at the new node. Returns the existing node when the
/// securable is already wrapped.
pub async fn create_node(
    db: &DatabaseConnection,
    ctx: &AuthContext,
    securable_type: &str,
    securable_id: i64,
    parents: &[i32],
    default_roles: &[String],
) -> Result<node::Model, AclError> {
    let txn = db.begin().await?;
    let model =
        create_node_in(&txn, ctx, securable_type, securable_id, parents, default_roles).await?;
    txn.commit().await?;
    Ok(model)
}

pub async fn create_node_in<C: ConnectionTrait>(
    conn: &C,
    ctx: &AuthContext,
    securable_type: &str,
    securable_id: i64,
    parents: &[i32],
    default_roles: &[String],
) -> Result<node::Model, AclError> {
    if securable_type == GLOBAL_SECURABLE_TYPE {
        return Err(AclError::Parent(
            "only one global node exists; it cannot be created".into(),
        ));
    }
    if let Some(existing) = node_for_securable(conn, securable_type, securable_id).await? {
        return Ok(existing);
    }

    let parent_ids: Vec<i32> = if parents.is_empty() {
        vec![GLOBAL_NODE_ID]
    } else {
        parents.to_vec()
    };
    if parent_ids.contains(&GLOBAL_NODE_ID) && parent_ids.len() > 1 {
        return Err(AclError::Parent(
            "the global node cannot share a child with explicit parents".into(),
        ));
    }
    for &pid in &parent_ids {
        find_node(conn, pid).await?;
    }

    let model = node::ActiveModel {
        securable_type: Set(securable_type.to_string()),
        securable_id: Set(securable_id),
        blocked: Set(false),
        created_at: Set(Utc::now().timestamp()),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    for &pid in &parent_ids {
        insert_edge(conn, pid, model.id).await?;
    }

    // Seed the new node's effective assignments from its parents.
    propagation::rebuild_subtree(conn, model.id).await?;

    for role_name in default_roles {
        let role = store::find_role_by_name(conn, role_name).await?;
        for &principal_id in &ctx.principals {
            store::grant_in(conn, &AuthContext::trusted(), role.id, principal_id, model.id)
                .await?;
        }
    }

    tracing::info!(
        node = model.id,
        securable_type,
        securable_id,
        "created node"
    );
    Ok(model)
}

/// Destroy a node: its assignments and effective assignments go with it,
/// children that lose their last parent fall back to the global node, and
/// every child subtree is recomputed from its remaining ancestors.
pub async fn destroy_node(db: &DatabaseConnection, node_id: i32) -> Result<(), AclError> {
    let txn = db.begin().await?;
    destroy_node_in(&txn, node_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn destroy_node_in<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<(), AclError> {
    if node_id == GLOBAL_NODE_ID {
        return Err(AclError::Parent("the global node cannot be destroyed".into()));
    }
    let node = find_node(conn, node_id).await?;
    let affected = reachable_from(conn, node_id).await?;
    lock_nodes(conn, &affected).await?;

    let children = children_of(conn, node_id).await?;

    assignment::Entity::delete_many()
        .filter(assignment::Column::NodeId.eq(node_id))
        .exec(conn)
        .await?;
    effective_assignment::Entity::delete_many()
        .filter(effective_assignment::Column::NodeId.eq(node_id))
        .exec(conn)
        .await?;
    edge::Entity::delete_many()
        .filter(
            Condition::any()
                .add(edge::Column::ParentId.eq(node_id))
                .add(edge::Column::ChildId.eq(node_id)),
        )
        .exec(conn)
        .await?;
    node::Entity::delete_by_id(node_id).exec(conn).await?;

    for child in children {
        if parents_of(conn, child).await?.is_empty() {
            insert_edge(conn, GLOBAL_NODE_ID, child).await?;
        }
        propagation::rebuild_subtree(conn, child).await?;
    }

    tracing::info!(
        node = node_id,
        securable_type = %node.securable_type,
        "destroyed node"
    );
    Ok(())
}

/// Attach `parent_id` above `node_id`. Rejects cycles and illegal
/// global-node shapes before anything is persisted; the default global edge
/// is dropped when the first explicit parent arrives.
pub async fn add_parent(
    db: &DatabaseConnection,
    node_id: i32,
    parent_id: i32,
) -> Result<(), AclError> {
    let txn = db.begin().await?;
    add_parent_in(&txn, node_id, parent_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn add_parent_in<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
    parent_id: i32,
) -> Result<(), AclError> {
    let node = find_node(conn, node_id).await?;
    find_node(conn, parent_id).await?;

    if node.id == GLOBAL_NODE_ID {
        return Err(AclError::Parent(
            "the global node cannot be the child of anything".into(),
        ));
    }
    if node.blocked {
        return Err(AclError::Parent(format!(
            "node {node_id} is blocked and cannot receive new parents"
        )));
    }

    let current_parents = parents_of(conn, node_id).await?;
    if current_parents.contains(&parent_id) {
        return Ok(());
    }
    if parent_id == GLOBAL_NODE_ID && !current_parents.is_empty() {
        return Err(AclError::Parent(format!(
            "node {node_id} has explicit parents; the global default does not apply"
        )));
    }
    if parent_id == node_id || ancestors_of(conn, parent_id).await?.contains(&node_id) {
        return Err(AclError::Cycle {
            node: node_id,
            parent: parent_id,
        });
    }

    let affected = reachable_from(conn, node_id).await?;
    lock_nodes(conn, &affected).await?;

    // The default global edge exists only while the node has no explicit
    // parents; the first real parent replaces it.
    let replacing_default =
        parent_id != GLOBAL_NODE_ID && current_parents == vec![GLOBAL_NODE_ID];
    if replacing_default {
        edge::Entity::delete_many()
            .filter(edge::Column::ParentId.eq(GLOBAL_NODE_ID))
            .filter(edge::Column::ChildId.eq(node_id))
            .exec(conn)
            .await?;
    }
    insert_edge(conn, parent_id, node_id).await?;

    if replacing_default {
        propagation::rebuild_subtree(conn, node_id).await?;
    } else {
        propagation::on_edge_added(conn, node_id, parent_id).await?;
    }

    tracing::debug!(node = node_id, parent = parent_id, "attached parent edge");
    Ok(())
}

/// Detach `parent_id` from above `node_id` and recompute the subtree from
/// the remaining ancestors. A node left parentless falls back to the global
/// node.
pub async fn remove_parent(
    db: &DatabaseConnection,
    node_id: i32,
    parent_id: i32,
) -> Result<(), AclError> {
    let txn = db.begin().await?;
    remove_parent_in(&txn, node_id, parent_id).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn remove_parent_in<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
    parent_id: i32,
) -> Result<(), AclError> {
    find_node(conn, node_id).await?;
    let current_parents = parents_of(conn, node_id).await?;
    if !current_parents.contains(&parent_id) {
        return Err(AclError::NotFound(format!(
            "edge {parent_id} -> {node_id}"
        )));
    }
    if parent_id == GLOBAL_NODE_ID {
        return Err(AclError::Parent(
            "the default global edge is managed automatically and cannot be detached".into(),
        ));
    }

    let affected = reachable_from(conn, node_id).await?;
    lock_nodes(conn, &affected).await?;

    edge::Entity::delete_many()
        .filter(edge::Column::ParentId.eq(parent_id))
        .filter(edge::Column::ChildId.eq(node_id))
        .exec(conn)
        .await?;

    if parents_of(conn, node_id).await?.is_empty() {
        insert_edge(conn, GLOBAL_NODE_ID, node_id).await?;
    }

    propagation::on_edge_removed(conn, node_id, parent_id).await?;

    tracing::debug!(node = node_id, parent = parent_id, "detached parent edge");
    Ok(())
}

/// Toggle the block flag. Blocking cuts inheritance from ancestors for the
/// node and everything below it; unblocking re-propagates from its
/// ancestors. The global node cannot be blocked.
pub async fn set_blocked(
    db: &DatabaseConnection,
    node_id: i32,
    blocked: bool,
) -> Result<(), AclError> {
    let txn = db.begin().await?;
    set_blocked_in(&txn, node_id, blocked).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn set_blocked_in<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
    blocked: bool,
) -> Result<(), AclError> {
    if node_id == GLOBAL_NODE_ID {
        return Err(AclError::Parent("the global node cannot be blocked".into()));
    }
    let node = find_node(conn, node_id).await?;
    if node.blocked == blocked {
        return Ok(());
    }

    let affected = reachable_from(conn, node_id).await?;
    lock_nodes(conn, &affected).await?;

    let mut active: node::ActiveModel = node.into();
    active.blocked = Set(blocked);
    active.update(conn).await?;

    propagation::on_block_changed(conn, node_id).await?;

    tracing::info!(node = node_id, blocked, "changed block flag");
    Ok(())
}

//! Maintains the `effective_assignments` materialization.
//!
//! This module is the only writer to that table. Every function here runs
//! inside the caller's transaction: an edge/assignment change and the
//! recomputation it implies commit together or not at all. The invariant
//! restored after every mutation: for each real assignment `(r, p, n)` there
//! is one effective tuple at `n` and at every block-respecting descendant of
//! `n`, and nothing else.

use std::collections::{HashMap, HashSet};

use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};

use crate::entities::{assignment, edge, effective_assignment, node};
use crate::errors::AclError;
use crate::graph::{self, closure};

async fn insert_effective<C: ConnectionTrait>(
    conn: &C,
    tuples: Vec<(i32, i32, i32)>,
) -> Result<(), AclError> {
    if tuples.is_empty() {
        return Ok(());
    }
    let models: Vec<effective_assignment::ActiveModel> = tuples
        .into_iter()
        .map(|(role_id, principal_id, node_id)| effective_assignment::ActiveModel {
            role_id: Set(role_id),
            principal_id: Set(principal_id),
            node_id: Set(node_id),
            ..Default::default()
        })
        .collect();
    effective_assignment::Entity::insert_many(models)
        .on_conflict(
            OnConflict::columns([
                effective_assignment::Column::RoleId,
                effective_assignment::Column::PrincipalId,
                effective_assignment::Column::NodeId,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}

/// A new assignment at `node_id` takes effect there and at every
/// block-respecting descendant.
pub async fn propagate_assignment<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
    principal_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    let targets = graph::reachable_from(conn, node_id).await?;
    graph::lock_nodes(conn, &targets).await?;
    let tuples = targets
        .into_iter()
        .map(|n| (role_id, principal_id, n))
        .collect();
    insert_effective(conn, tuples).await
}

/// Remove the effective tuples a revoked assignment no longer justifies.
///
/// The affected subtree is wiped for the (role, principal) pair and then
/// re-derived from every surviving assignment of the same pair, wherever it
/// sits, so a tuple still justified through another ancestor survives. This
/// is exact in any topology, diamonds included.
pub async fn depropagate_assignment<C: ConnectionTrait>(
    conn: &C,
    role_id: i32,
    principal_id: i32,
    node_id: i32,
) -> Result<(), AclError> {
    let affected = graph::reachable_from(conn, node_id).await?;
    graph::lock_nodes(conn, &affected).await?;
    let affected_vec: Vec<i32> = affected.iter().copied().collect();

    effective_assignment::Entity::delete_many()
        .filter(effective_assignment::Column::RoleId.eq(role_id))
        .filter(effective_assignment::Column::PrincipalId.eq(principal_id))
        .filter(effective_assignment::Column::NodeId.is_in(affected_vec))
        .exec(conn)
        .await?;

    let survivors = assignment::Entity::find()
        .filter(assignment::Column::RoleId.eq(role_id))
        .filter(assignment::Column::PrincipalId.eq(principal_id))
        .all(conn)
        .await?;

    let mut tuples: HashSet<(i32, i32, i32)> = HashSet::new();
    for survivor in survivors {
        let reach = graph::reachable_from(conn, survivor.node_id).await?;
        for target in reach.intersection(&affected) {
            tuples.insert((role_id, principal_id, *target));
        }
    }
    insert_effective(conn, tuples.into_iter().collect()).await
}

/// A new edge makes everything effective at `parent_id` reach `node_id`'s
/// subtree. No-op when the child is blocked: nothing flows through.
pub async fn on_edge_added<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
    parent_id: i32,
) -> Result<(), AclError> {
    let node = graph::find_node(conn, node_id).await?;
    if node.blocked {
        return Ok(());
    }
    let parent_effective = effective_assignment::Entity::find()
        .filter(effective_assignment::Column::NodeId.eq(parent_id))
        .all(conn)
        .await?;
    if parent_effective.is_empty() {
        return Ok(());
    }

    let targets = graph::reachable_from(conn, node_id).await?;
    graph::lock_nodes(conn, &targets).await?;

    let pairs: HashSet<(i32, i32)> = parent_effective
        .iter()
        .map(|ea| (ea.role_id, ea.principal_id))
        .collect();
    let mut tuples = Vec::with_capacity(pairs.len() * targets.len());
    for &(role_id, principal_id) in &pairs {
        for &target in &targets {
            tuples.push((role_id, principal_id, target));
        }
    }
    insert_effective(conn, tuples).await
}

/// A removed edge invalidates whatever flowed through it; the simplest
/// correct strategy is a full recompute of the child's subtree from its
/// remaining ancestors.
pub async fn on_edge_removed<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
    _parent_id: i32,
) -> Result<(), AclError> {
    rebuild_subtree(conn, node_id).await
}

/// Blocking or unblocking changes which ancestor assignments reach the
/// subtree; recompute it. Inheritance from parents is included exactly when
/// the node is now unblocked.
pub async fn on_block_changed<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<(), AclError> {
    rebuild_subtree(conn, node_id).await
}

/// Recompute the effective assignments of `node_id`'s block-respecting
/// subtree from scratch.
///
/// Parents outside the subtree are already consistent, so their effective
/// sets are read as-is; nodes inside are recomputed top-down in topological
/// order as direct assignments plus the union of their parents' effective
/// sets (skipped for a blocked subtree root, which inherits nothing).
pub async fn rebuild_subtree<C: ConnectionTrait>(
    conn: &C,
    node_id: i32,
) -> Result<(), AclError> {
    let root = graph::find_node(conn, node_id).await?;
    let affected = graph::reachable_from(conn, node_id).await?;
    graph::lock_nodes(conn, &affected).await?;
    let affected_vec: Vec<i32> = affected.iter().copied().collect();

    effective_assignment::Entity::delete_many()
        .filter(effective_assignment::Column::NodeId.is_in(affected_vec.clone()))
        .exec(conn)
        .await?;

    let mut direct: HashMap<i32, HashSet<(i32, i32)>> = HashMap::new();
    for row in assignment::Entity::find()
        .filter(assignment::Column::NodeId.is_in(affected_vec.clone()))
        .all(conn)
        .await?
    {
        direct
            .entry(row.node_id)
            .or_default()
            .insert((row.role_id, row.principal_id));
    }

    let in_edges = edge::Entity::find()
        .filter(edge::Column::ChildId.is_in(affected_vec))
        .all(conn)
        .await?;
    let mut parents_of: HashMap<i32, Vec<i32>> = HashMap::new();
    for e in &in_edges {
        parents_of.entry(e.child_id).or_default().push(e.parent_id);
    }

    let outside_parents: HashSet<i32> = in_edges
        .iter()
        .map(|e| e.parent_id)
        .filter(|p| !affected.contains(p))
        .collect();
    let mut effective: HashMap<i32, HashSet<(i32, i32)>> = HashMap::new();
    if !outside_parents.is_empty() {
        for ea in effective_assignment::Entity::find()
            .filter(
                effective_assignment::Column::NodeId
                    .is_in(outside_parents.into_iter().collect::<Vec<_>>()),
            )
            .all(conn)
            .await?
        {
            effective
                .entry(ea.node_id)
                .or_default()
                .insert((ea.role_id, ea.principal_id));
        }
    }

    // Only the subtree root can be blocked here: traversal pruned the rest.
    let order = closure::topological_order(&affected, &parents_of);
    let mut tuples: Vec<(i32, i32, i32)> = Vec::new();
    for current in order {
        let mut set = direct.remove(&current).unwrap_or_default();
        let inherits = !(current == node_id && root.blocked);
        if inherits {
            if let Some(parents) = parents_of.get(&current) {
                for parent in parents {
                    if let Some(inherited) = effective.get(parent) {
                        set.extend(inherited.iter().copied());
                    }
                }
            }
        }
        tuples.extend(set.iter().map(|&(r, p)| (r, p, current)));
        effective.insert(current, set);
    }

    insert_effective(conn, tuples).await
}

/// The effective set implied by the current source-of-truth tables,
/// computed over an in-memory snapshot.
async fn expected_effective_set<C: ConnectionTrait>(
    conn: &C,
) -> Result<HashSet<(i32, i32, i32)>, AclError> {
    let assignments: Vec<(i32, i32, i32)> = assignment::Entity::find()
        .all(conn)
        .await?
        .into_iter()
        .map(|a| (a.role_id, a.principal_id, a.node_id))
        .collect();
    let mut children_of: HashMap<i32, Vec<i32>> = HashMap::new();
    for e in edge::Entity::find().all(conn).await? {
        children_of.entry(e.parent_id).or_default().push(e.child_id);
    }
    let blocked: HashSet<i32> = node::Entity::find()
        .filter(node::Column::Blocked.eq(true))
        .all(conn)
        .await?
        .into_iter()
        .map(|n| n.id)
        .collect();
    Ok(closure::effective_set(&assignments, &children_of, &blocked))
}

/// Recovery path: discard the whole materialization and regenerate it from
/// `assignments` + `edges` + block flags.
pub async fn rebuild_all(db: &DatabaseConnection) -> Result<(), AclError> {
    let txn = db.begin().await?;
    rebuild_all_in(&txn).await?;
    txn.commit().await?;
    Ok(())
}

pub async fn rebuild_all_in<C: ConnectionTrait>(conn: &C) -> Result<(), AclError> {
    effective_assignment::Entity::delete_many()
        .exec(conn)
        .await?;
    let expected = expected_effective_set(conn).await?;
    let count = expected.len();
    insert_effective(conn, expected.into_iter().collect()).await?;
    tracing::info!(tuples = count, "rebuilt effective assignments from scratch");
    Ok(())
}

/// Discrepancies between the materialization and a from-scratch
/// recomputation. Both lists empty means the cache is exact.
#[derive(Debug, Default)]
pub struct ConsistencyReport {
    /// Tuples the invariant requires but the table lacks.
    pub missing: Vec<(i32, i32, i32)>,
    /// Tuples the table holds without justification.
    pub stale: Vec<(i32, i32, i32)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.stale.is_empty()
    }
}

pub async fn verify_consistency<C: ConnectionTrait>(
    conn: &C,
) -> Result<ConsistencyReport, AclError> {
    let expected = expected_effective_set(conn).await?;
    let actual: HashSet<(i32, i32, i32)> = effective_assignment::Entity::find()
        .all(conn)
        .await?
        .into_iter()
        .map(|ea| (ea.role_id, ea.principal_id, ea.node_id))
        .collect();

    let mut missing: Vec<_> = expected.difference(&actual).copied().collect();
    let mut stale: Vec<_> = actual.difference(&expected).copied().collect();
    missing.sort_unstable();
    stale.sort_unstable();

    if !missing.is_empty() || !stale.is_empty() {
        tracing::warn!(
            missing = missing.len(),
            stale = stale.len(),
            "effective assignment cache disagrees with recomputation"
        );
    }
    Ok(ConsistencyReport { missing, stale })
}

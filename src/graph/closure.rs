//! Pure reachability helpers over adjacency snapshots.
//!
//! The logical traversal contract (ancestors, descendants, block-respecting
//! reach) lives here, independent of the query engine. The database-backed
//! traversals in the parent module satisfy the same contract with frontier
//! queries; full rebuilds and the consistency checker run these functions
//! over an in-memory snapshot of `edges` + `nodes.blocked`.

use std::collections::{HashMap, HashSet, VecDeque};

/// All nodes reachable from `start` following the given adjacency, `start`
/// included. Pass a parent->children map to walk down, a child->parents map
/// to walk up.
pub fn reachable(adjacency: &HashMap<i32, Vec<i32>>, start: i32) -> HashSet<i32> {
    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        if let Some(nexts) = adjacency.get(&current) {
            for &next in nexts {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    visited
}

/// The block-respecting down-set of `start`: every descendant an assignment
/// at `start` propagates to, plus `start` itself. Traversal never descends
/// into a blocked child; `start` is included even when itself blocked,
/// because direct assignments at a blocked node still take effect there.
pub fn reachable_down_unblocked(
    children_of: &HashMap<i32, Vec<i32>>,
    blocked: &HashSet<i32>,
    start: i32,
) -> HashSet<i32> {
    let mut visited = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        if let Some(children) = children_of.get(&current) {
            for &child in children {
                if blocked.contains(&child) {
                    continue;
                }
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }
    visited
}

/// The block-respecting up-set of `start`: every node whose assignments
/// reach `start`, plus `start` itself. A blocked `start` reaches nothing
/// above it; ascent continues past a parent only while that parent is
/// unblocked (its own direct assignments flow down regardless).
pub fn reaching_up_unblocked(
    parents_of: &HashMap<i32, Vec<i32>>,
    blocked: &HashSet<i32>,
    start: i32,
) -> HashSet<i32> {
    let mut visited = HashSet::from([start]);
    if blocked.contains(&start) {
        return visited;
    }
    let mut queue = VecDeque::from([start]);
    while let Some(current) = queue.pop_front() {
        if let Some(parents) = parents_of.get(&current) {
            for &parent in parents {
                if visited.insert(parent) && !blocked.contains(&parent) {
                    queue.push_back(parent);
                }
            }
        }
    }
    visited
}

/// Whether adding `parent` above `node` would close a cycle: true when the
/// nodes coincide or `node` already sits among `parent`'s ancestors.
pub fn would_create_cycle(
    parents_of: &HashMap<i32, Vec<i32>>,
    node: i32,
    parent: i32,
) -> bool {
    node == parent || reachable(parents_of, parent).contains(&node)
}

/// Kahn topological order of `nodes`, counting only parent edges internal to
/// the set. External parents are assumed already settled by the caller.
pub fn topological_order(
    nodes: &HashSet<i32>,
    parents_of: &HashMap<i32, Vec<i32>>,
) -> Vec<i32> {
    let mut in_degree: HashMap<i32, usize> = HashMap::new();
    let mut children_in: HashMap<i32, Vec<i32>> = HashMap::new();
    for &n in nodes {
        let internal_parents = parents_of
            .get(&n)
            .map(|ps| ps.iter().filter(|p| nodes.contains(p)).count())
            .unwrap_or(0);
        in_degree.insert(n, internal_parents);
        if let Some(ps) = parents_of.get(&n) {
            for p in ps.iter().filter(|p| nodes.contains(p)) {
                children_in.entry(*p).or_default().push(n);
            }
        }
    }

    let mut queue: VecDeque<i32> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(n) = queue.pop_front() {
        order.push(n);
        if let Some(children) = children_in.get(&n) {
            for &c in children {
                if let Some(d) = in_degree.get_mut(&c) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(c);
                    }
                }
            }
        }
    }
    order
}

/// The full effective-assignment set implied by `assignments` under the
/// given graph shape: for every real assignment, one tuple at its node and
/// at every block-respecting descendant.
pub fn effective_set(
    assignments: &[(i32, i32, i32)],
    children_of: &HashMap<i32, Vec<i32>>,
    blocked: &HashSet<i32>,
) -> HashSet<(i32, i32, i32)> {
    let mut result = HashSet::new();
    for &(role_id, principal_id, node_id) in assignments {
        for target in reachable_down_unblocked(children_of, blocked, node_id) {
            result.insert((role_id, principal_id, target));
        }
    }
    result
}

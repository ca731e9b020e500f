mod helpers;

use helpers::db::effective_tuples;
use helpers::{NodeBuilder, PrincipalBuilder, RoleBuilder, TestDb};
use palisade::context::AuthContext;
use palisade::graph::{self, GLOBAL_NODE_ID};
use palisade::{propagation, resolver, store};
use sea_orm::{ActiveModelTrait, Set};

#[tokio::test]
async fn test_grant_propagates_to_descendants() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permissions(&["view", "modify"])
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;

    store::grant(db.connection(), &AuthContext::trusted(), owner.id, p1.id, a.id)
        .await
        .unwrap();

    assert_eq!(
        effective_tuples(db.connection()).await,
        vec![(owner.id, p1.id, a.id), (owner.id, p1.id, b.id)]
    );
}

#[tokio::test]
async fn test_node_added_under_granted_node_inherits() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let owner = RoleBuilder::new("owner")
        .with_permissions(&["view", "modify"])
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;

    store::grant(db.connection(), &AuthContext::trusted(), owner.id, p1.id, a.id)
        .await
        .unwrap();

    // B arrives after the grant and must inherit through the new edge
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;

    let ctx = AuthContext::for_principal(p1.id);
    assert!(resolver::can(db.connection(), &ctx, &["view"], b.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_grant_is_idempotent() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    let after_first = effective_tuples(db.connection()).await;

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    assert_eq!(effective_tuples(db.connection()).await, after_first);

    let assignments = store::assignments_at(db.connection(), a.id).await.unwrap();
    assert_eq!(assignments.len(), 1);
}

#[tokio::test]
async fn test_revoke_round_trips_to_pre_grant_state() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let _b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    let before = effective_tuples(db.connection()).await;

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    store::revoke(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();

    assert_eq!(effective_tuples(db.connection()).await, before);
}

#[tokio::test]
async fn test_sibling_grants_are_independently_justified() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let c = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let d = NodeBuilder::new("document", 2)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let editor = RoleBuilder::new("editor")
        .with_permission("modify")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, editor.id, p1.id, c.id)
        .await
        .unwrap();
    store::grant(db.connection(), &ctx, editor.id, p1.id, d.id)
        .await
        .unwrap();

    store::revoke(db.connection(), &ctx, editor.id, p1.id, c.id)
        .await
        .unwrap();

    let check = AuthContext::for_principal(p1.id);
    assert!(!resolver::can(db.connection(), &check, &["modify"], c.id)
        .await
        .unwrap());
    assert!(resolver::can(db.connection(), &check, &["modify"], d.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_diamond_revoke_keeps_other_path_justification() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("folder", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let c = NodeBuilder::new("folder", 2)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let d = NodeBuilder::new("document", 1)
        .with_parent(b.id)
        .create(db.connection())
        .await;
    graph::add_parent(db.connection(), d.id, c.id).await.unwrap();

    let editor = RoleBuilder::new("editor")
        .with_permission("modify")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    // d is reachable from both grants
    store::grant(db.connection(), &ctx, editor.id, p1.id, b.id)
        .await
        .unwrap();
    store::grant(db.connection(), &ctx, editor.id, p1.id, c.id)
        .await
        .unwrap();

    store::revoke(db.connection(), &ctx, editor.id, p1.id, b.id)
        .await
        .unwrap();

    let check = AuthContext::for_principal(p1.id);
    assert!(!resolver::can(db.connection(), &check, &["modify"], b.id)
        .await
        .unwrap());
    // still justified through c
    assert!(resolver::can(db.connection(), &check, &["modify"], d.id)
        .await
        .unwrap());

    store::revoke(db.connection(), &ctx, editor.id, p1.id, c.id)
        .await
        .unwrap();
    assert!(!resolver::can(db.connection(), &check, &["modify"], d.id)
        .await
        .unwrap());

    let report = propagation::verify_consistency(db.connection()).await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_blocking_cuts_inherited_assignments() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let c = NodeBuilder::new("section", 1)
        .with_parent(b.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();

    let check = AuthContext::for_principal(p1.id);
    assert!(resolver::can(db.connection(), &check, &["view"], b.id)
        .await
        .unwrap());
    assert!(resolver::can(db.connection(), &check, &["view"], c.id)
        .await
        .unwrap());

    graph::set_blocked(db.connection(), b.id, true).await.unwrap();

    assert!(!resolver::can(db.connection(), &check, &["view"], b.id)
        .await
        .unwrap());
    assert!(!resolver::can(db.connection(), &check, &["view"], c.id)
        .await
        .unwrap());
    assert!(resolver::can(db.connection(), &check, &["view"], a.id)
        .await
        .unwrap());

    // unblocking re-propagates from the ancestors
    graph::set_blocked(db.connection(), b.id, false).await.unwrap();
    assert!(resolver::can(db.connection(), &check, &["view"], c.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_direct_assignment_at_blocked_node_still_propagates_below() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let c = NodeBuilder::new("section", 1)
        .with_parent(b.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    graph::set_blocked(db.connection(), b.id, true).await.unwrap();
    store::grant(db.connection(), &ctx, owner.id, p1.id, b.id)
        .await
        .unwrap();

    let check = AuthContext::for_principal(p1.id);
    assert!(resolver::can(db.connection(), &check, &["view"], b.id)
        .await
        .unwrap());
    assert!(resolver::can(db.connection(), &check, &["view"], c.id)
        .await
        .unwrap());
    assert!(!resolver::can(db.connection(), &check, &["view"], a.id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_edge_removal_recomputes_subtree() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();

    let check = AuthContext::for_principal(p1.id);
    assert!(resolver::can(db.connection(), &check, &["view"], b.id)
        .await
        .unwrap());

    graph::remove_parent(db.connection(), b.id, a.id)
        .await
        .unwrap();

    assert!(!resolver::can(db.connection(), &check, &["view"], b.id)
        .await
        .unwrap());

    let report = propagation::verify_consistency(db.connection()).await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_destroying_role_and_principal_depropagates() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let editor = RoleBuilder::new("editor")
        .with_permission("modify")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let p2 = PrincipalBuilder::user(2).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    store::grant(db.connection(), &ctx, editor.id, p2.id, a.id)
        .await
        .unwrap();

    store::destroy_role(db.connection(), owner.id).await.unwrap();
    let check1 = AuthContext::for_principal(p1.id);
    assert!(!resolver::can(db.connection(), &check1, &["view"], b.id)
        .await
        .unwrap());

    store::destroy_principal(db.connection(), p2.id).await.unwrap();
    assert_eq!(effective_tuples(db.connection()).await, vec![]);

    let report = propagation::verify_consistency(db.connection()).await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_cache_matches_recomputation_after_mutation_sequence() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("folder", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let c = NodeBuilder::new("folder", 2)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let d = NodeBuilder::new("document", 1)
        .with_parent(b.id)
        .create(db.connection())
        .await;
    graph::add_parent(db.connection(), d.id, c.id).await.unwrap();

    let owner = RoleBuilder::new("owner")
        .with_permissions(&["view", "modify"])
        .create(db.connection())
        .await;
    let viewer = RoleBuilder::new("viewer")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let p2 = PrincipalBuilder::user(2).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    store::grant(db.connection(), &ctx, viewer.id, p2.id, b.id)
        .await
        .unwrap();
    graph::set_blocked(db.connection(), c.id, true).await.unwrap();
    store::grant(db.connection(), &ctx, viewer.id, p2.id, c.id)
        .await
        .unwrap();
    store::revoke(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    graph::remove_parent(db.connection(), d.id, b.id)
        .await
        .unwrap();
    graph::set_blocked(db.connection(), c.id, false).await.unwrap();
    store::grant(db.connection(), &ctx, owner.id, p1.id, d.id)
        .await
        .unwrap();

    let report = propagation::verify_consistency(db.connection()).await.unwrap();
    assert!(
        report.is_consistent(),
        "missing: {:?}, stale: {:?}",
        report.missing,
        report.stale
    );
}

#[tokio::test]
async fn test_rebuild_recovers_from_corruption() {
    let db = TestDb::new().await;
    let a = NodeBuilder::new("project", 1).create(db.connection()).await;
    let b = NodeBuilder::new("document", 1)
        .with_parent(a.id)
        .create(db.connection())
        .await;
    let owner = RoleBuilder::new("owner")
        .with_permission("view")
        .create(db.connection())
        .await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::trusted();

    store::grant(db.connection(), &ctx, owner.id, p1.id, a.id)
        .await
        .unwrap();
    let good = effective_tuples(db.connection()).await;

    // simulate an aborted migration leaving an unjustified tuple behind
    palisade::entities::effective_assignment::ActiveModel {
        role_id: Set(owner.id),
        principal_id: Set(p1.id),
        node_id: Set(GLOBAL_NODE_ID),
        ..Default::default()
    }
    .insert(db.connection())
    .await
    .unwrap();

    let report = propagation::verify_consistency(db.connection()).await.unwrap();
    assert_eq!(report.stale, vec![(owner.id, p1.id, GLOBAL_NODE_ID)]);
    assert!(report.missing.is_empty());

    propagation::rebuild_all(db.connection()).await.unwrap();
    assert_eq!(effective_tuples(db.connection()).await, good);
    assert!(propagation::verify_consistency(db.connection())
        .await
        .unwrap()
        .is_consistent());

    // ensure b's inheritance survived the rebuild
    let check = AuthContext::for_principal(p1.id);
    assert!(resolver::can(db.connection(), &check, &["view"], b.id)
        .await
        .unwrap());
}

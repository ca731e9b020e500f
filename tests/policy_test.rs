mod helpers;

use helpers::{NodeBuilder, PrincipalBuilder, TestDb};
use palisade::context::AuthContext;
use palisade::registry::loader::{load_policies, sync_roles};
use palisade::{resolver, store};

const POLICY: &str = r#"
permission "view" {
    description "Read access to the securable"
    protects {
        - "document:show"
    }
}

permission "modify"
permission "list"
permission "grant_roles"

role "viewer" {
    permissions {
        - "view"
        - "list"
    }
}

role "owner" local=true global=true {
    permissions {
        - "view"
        - "modify"
        - "list"
        - "grant_roles"
    }
}

requirement on="document" operation="index" {
    - "list"
}

default-requirement {
    - "list"
}
"#;

#[tokio::test]
async fn test_policy_roles_sync_and_resolve_end_to_end() {
    let db = TestDb::new().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("core.kdl"), POLICY).unwrap();

    let (registry, seeds) = load_policies(dir.path(), &["list".into()]).unwrap();
    sync_roles(db.connection(), &seeds).await.unwrap();

    let owner = store::find_role_by_name(db.connection(), "owner")
        .await
        .unwrap();
    assert!(owner.local);
    assert!(owner.global);
    assert_eq!(
        store::permissions_of_role(db.connection(), owner.id)
            .await
            .unwrap(),
        vec!["grant_roles", "list", "modify", "view"]
    );

    let a = NodeBuilder::new("document", 1).create(db.connection()).await;
    let p1 = PrincipalBuilder::user(1).create(db.connection()).await;
    store::grant(db.connection(), &AuthContext::trusted(), owner.id, p1.id, a.id)
        .await
        .unwrap();

    // the requirement declaration drives the check
    let required = registry.requirements_for("document", "index");
    let ctx = AuthContext::for_principal(p1.id);
    assert!(resolver::can(db.connection(), &ctx, &required, a.id)
        .await
        .unwrap());

    // undeclared operations fall back to the default requirement
    let fallback = registry.requirements_for("document", "archive");
    assert_eq!(fallback, vec!["list"]);
}

#[tokio::test]
async fn test_resync_updates_flags_and_permissions() {
    let db = TestDb::new().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("core.kdl"), POLICY).unwrap();

    let (_registry, seeds) = load_policies(dir.path(), &["list".into()]).unwrap();
    sync_roles(db.connection(), &seeds).await.unwrap();
    let viewer = store::find_role_by_name(db.connection(), "viewer")
        .await
        .unwrap();

    // the next deploy narrows the viewer role and makes it global
    std::fs::write(
        dir.path().join("core.kdl"),
        r#"
permission "view"

role "viewer" local=true global=true {
    permissions {
        - "view"
    }
}
"#,
    )
    .unwrap();
    let (_registry, seeds) = load_policies(dir.path(), &["list".into()]).unwrap();
    sync_roles(db.connection(), &seeds).await.unwrap();

    let updated = store::find_role_by_name(db.connection(), "viewer")
        .await
        .unwrap();
    assert_eq!(updated.id, viewer.id);
    assert!(updated.global);
    assert_eq!(
        store::permissions_of_role(db.connection(), updated.id)
            .await
            .unwrap(),
        vec!["view"]
    );
}

#[tokio::test]
async fn test_default_roles_granted_at_node_creation() {
    let db = TestDb::new().await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("core.kdl"), POLICY).unwrap();

    let (_registry, seeds) = load_policies(dir.path(), &["list".into()]).unwrap();
    sync_roles(db.connection(), &seeds).await.unwrap();

    let creator = PrincipalBuilder::user(1).create(db.connection()).await;
    let ctx = AuthContext::for_principal(creator.id).into_trusted();
    let node = palisade::graph::create_node(
        db.connection(),
        &ctx,
        "document",
        42,
        &[],
        &["owner".to_string()],
    )
    .await
    .unwrap();

    let check = AuthContext::for_principal(creator.id);
    assert!(resolver::can(db.connection(), &check, &["view", "modify"], node.id)
        .await
        .unwrap());
}

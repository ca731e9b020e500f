use palisade::context::AuthContext;
use palisade::entities;
use palisade::{graph, store};
use sea_orm::DatabaseConnection;

/// Builder for creating test nodes
pub struct NodeBuilder {
    securable_type: String,
    securable_id: i64,
    parents: Vec<i32>,
    blocked: bool,
}

impl NodeBuilder {
    pub fn new(securable_type: &str, securable_id: i64) -> Self {
        Self {
            securable_type: securable_type.to_string(),
            securable_id,
            parents: Vec::new(),
            blocked: false,
        }
    }

    pub fn with_parent(mut self, parent_id: i32) -> Self {
        self.parents.push(parent_id);
        self
    }

    pub fn blocked(mut self) -> Self {
        self.blocked = true;
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::node::Model {
        let node = graph::create_node(
            db,
            &AuthContext::trusted(),
            &self.securable_type,
            self.securable_id,
            &self.parents,
            &[],
        )
        .await
        .expect("Failed to create test node");

        if self.blocked {
            graph::set_blocked(db, node.id, true)
                .await
                .expect("Failed to block test node");
        }
        node
    }
}

/// Builder for creating test roles
pub struct RoleBuilder {
    name: String,
    local: bool,
    global: bool,
    permissions: Vec<String>,
}

impl RoleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            local: true,
            global: false,
            permissions: Vec::new(),
        }
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn local_only(mut self) -> Self {
        self.local = true;
        self.global = false;
        self
    }

    pub fn global_only(mut self) -> Self {
        self.local = false;
        self.global = true;
        self
    }

    pub fn with_permission(mut self, permission: &str) -> Self {
        self.permissions.push(permission.to_string());
        self
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::role::Model {
        let role = store::create_role(db, &self.name, self.local, self.global)
            .await
            .expect("Failed to create test role");
        store::set_role_permissions(db, role.id, &self.permissions)
            .await
            .expect("Failed to set test role permissions");
        role
    }
}

/// Builder for creating test principals
pub struct PrincipalBuilder {
    subject_type: String,
    subject_id: i64,
}

impl PrincipalBuilder {
    pub fn new(subject_type: &str, subject_id: i64) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id,
        }
    }

    pub fn user(subject_id: i64) -> Self {
        Self::new("user", subject_id)
    }

    pub async fn create(self, db: &DatabaseConnection) -> entities::principal::Model {
        store::create_principal(db, &self.subject_type, self.subject_id)
            .await
            .expect("Failed to create test principal")
    }
}

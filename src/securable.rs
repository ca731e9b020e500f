//! The seam between the engine and the application's entity types.
//!
//! The node graph never sees concrete entities; it sees this capability.
//! The consuming data layer implements it per entity type and hands
//! instances to [`create_node_for`] to wire declared parents into graph
//! construction.

use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};

use crate::context::AuthContext;
use crate::entities::node;
use crate::errors::AclError;
use crate::graph;

/// One securable application entity: a stable type tag, an identifier
/// within that type, and the entities it inherits permissions from.
pub trait Securable {
    fn type_tag(&self) -> &str;

    fn securable_id(&self) -> i64;

    /// (type tag, securable id) of the parent entities. Empty means the
    /// node attaches to the global node.
    fn declared_parents(&self) -> Vec<(String, i64)> {
        Vec::new()
    }
}

/// Create (or fetch) the node wrapping `securable`, resolving its declared
/// parents to existing nodes. A declared parent without a node is a
/// `NotFound` error: parents must be wrapped before their children.
pub async fn create_node_for<S>(
    db: &DatabaseConnection,
    ctx: &AuthContext,
    securable: &S,
    default_roles: &[String],
) -> Result<node::Model, AclError>
where
    S: Securable + ?Sized,
{
    let txn = db.begin().await?;
    let model = create_node_for_in(&txn, ctx, securable, default_roles).await?;
    txn.commit().await?;
    Ok(model)
}

pub async fn create_node_for_in<C, S>(
    conn: &C,
    ctx: &AuthContext,
    securable: &S,
    default_roles: &[String],
) -> Result<node::Model, AclError>
where
    C: ConnectionTrait,
    S: Securable + ?Sized,
{
    let mut parent_ids = Vec::new();
    for (type_tag, securable_id) in securable.declared_parents() {
        let parent = graph::node_for_securable(conn, &type_tag, securable_id)
            .await?
            .ok_or_else(|| {
                AclError::NotFound(format!("node for securable {type_tag}/{securable_id}"))
            })?;
        parent_ids.push(parent.id);
    }
    graph::create_node_in(
        conn,
        ctx,
        securable.type_tag(),
        securable.securable_id(),
        &parent_ids,
        default_roles,
    )
    .await
}

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AclError {
    #[error("adding node {parent} as a parent of node {node} would create a cycle")]
    #[diagnostic(
        code(palisade::graph::cycle),
        help("The node graph must stay acyclic; check the ancestor chain of the intended parent")
    )]
    Cycle { node: i32, parent: i32 },

    #[error("illegal parent edge: {0}")]
    #[diagnostic(
        code(palisade::graph::parent),
        help("The global node has no parents, keeps its children exclusive of other parents, and blocked nodes accept no new parents")
    )]
    Parent(String),

    #[error("permission denied at node {node}: missing permissions {missing:?}")]
    #[diagnostic(
        code(palisade::resolver::unauthorized),
        help("Grant a role carrying the missing permissions at this node or at the global node")
    )]
    Unauthorized {
        node: i32,
        missing: Vec<String>,
        held_roles: Vec<String>,
    },

    #[error("role `{role}` cannot be assigned at node {node}")]
    #[diagnostic(
        code(palisade::store::invalid_role_assignment),
        help("Global-flagged roles go on the global node, local-flagged roles everywhere else")
    )]
    InvalidRoleAssignment { role: String, node: i32 },

    #[error("not found: {0}")]
    #[diagnostic(code(palisade::not_found))]
    NotFound(String),

    #[error("invalid policy: {0}")]
    #[diagnostic(
        code(palisade::registry::invalid_policy),
        help("Each policy file must contain valid `permission`, `role`, `requirement`, or `default-requirement` KDL nodes")
    )]
    InvalidPolicy(String),

    #[error("failed to load policy file `{path}`")]
    #[diagnostic(
        code(palisade::registry::policy_load),
        help("Check that the file exists and contains valid KDL syntax")
    )]
    PolicyLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("KDL parse error: {0}")]
    #[diagnostic(
        code(palisade::registry::kdl_parse),
        help("Check your KDL file syntax — see https://kdl.dev for the specification")
    )]
    KdlParse(String),

    #[error("database error: {0}")]
    #[diagnostic(code(palisade::db))]
    Db(#[from] sea_orm::DbErr),

    #[error("config error: {0}")]
    #[diagnostic(code(palisade::config))]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    #[diagnostic(code(palisade::io))]
    Io(#[from] std::io::Error),
}

//! KDL policy files: permission metadata, role definitions, and
//! per-(entity type, operation) permission requirements.
//!
//! Roles declared here are upserted into the database at startup by
//! [`sync_roles`]; the rest compiles into the immutable [`Registry`].

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use kdl::KdlDocument;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set};

use crate::entities::{role, role_permission};
use crate::errors::AclError;
use crate::registry::{PermissionMeta, Registry};

/// A role definition from a policy file, destined for the roles tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSeed {
    pub name: String,
    pub local: bool,
    pub global: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementDecl {
    pub entity_type: String,
    pub operation: String,
    pub permissions: Vec<String>,
}

/// Intermediate result from parsing a single KDL file.
#[derive(Debug, Clone, Default)]
pub struct ParsedPolicy {
    pub permissions: Vec<(String, PermissionMeta)>,
    pub roles: Vec<RoleSeed>,
    pub requirements: Vec<RequirementDecl>,
    pub default_requirement: Option<Vec<String>>,
}

/// Parse a KDL document string into typed policy structs.
pub fn parse_kdl_document(source: &str) -> Result<ParsedPolicy, AclError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e: kdl::KdlError| AclError::KdlParse(e.to_string()))?;

    let mut policy = ParsedPolicy::default();

    for node in doc.nodes() {
        match node.name().value() {
            "permission" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    AclError::InvalidPolicy(
                        "permission node requires a string argument (e.g. permission \"view\")"
                            .into(),
                    )
                })?;

                let mut meta = PermissionMeta::default();
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "description" => {
                                meta.description = first_string_arg(child);
                            }
                            "protects" => {
                                meta.protects = dash_list(child);
                            }
                            other => {
                                return Err(AclError::InvalidPolicy(format!(
                                    "unexpected child `{other}` in permission `{name}` (expected `description` or `protects`)"
                                )));
                            }
                        }
                    }
                }
                policy.permissions.push((name, meta));
            }
            "role" => {
                let name = first_string_arg(node).ok_or_else(|| {
                    AclError::InvalidPolicy(
                        "role node requires a string argument (e.g. role \"owner\")".into(),
                    )
                })?;

                let local = node
                    .get("local")
                    .and_then(|v| v.value().as_bool())
                    .unwrap_or(true);
                let global = node
                    .get("global")
                    .and_then(|v| v.value().as_bool())
                    .unwrap_or(false);

                let mut permissions = Vec::new();
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "permissions" => {
                                permissions = dash_list(child);
                            }
                            other => {
                                return Err(AclError::InvalidPolicy(format!(
                                    "unexpected child `{other}` in role `{name}` (expected `permissions`)"
                                )));
                            }
                        }
                    }
                }
                policy.roles.push(RoleSeed {
                    name,
                    local,
                    global,
                    permissions,
                });
            }
            "requirement" => {
                let entity_type = node.get("on").and_then(|v| v.value().as_string()).ok_or_else(|| {
                    AclError::InvalidPolicy(
                        "requirement missing `on` property (e.g. on=\"document\")".into(),
                    )
                })?;
                let operation =
                    node.get("operation")
                        .and_then(|v| v.value().as_string())
                        .ok_or_else(|| {
                            AclError::InvalidPolicy(format!(
                                "requirement on=\"{entity_type}\" missing `operation` property"
                            ))
                        })?;
                policy.requirements.push(RequirementDecl {
                    entity_type: entity_type.to_string(),
                    operation: operation.to_string(),
                    permissions: dash_list(node),
                });
            }
            "default-requirement" => {
                policy.default_requirement = Some(dash_list(node));
            }
            other => {
                tracing::warn!("ignoring unknown top-level KDL node `{other}`");
            }
        }
    }

    Ok(policy)
}

/// Load all `.kdl` policy files from the given directory and compile them
/// into an immutable [`Registry`] plus the role seeds for [`sync_roles`].
pub fn load_policies(
    dir: &Path,
    fallback_default: &[String],
) -> Result<(Registry, Vec<RoleSeed>), AclError> {
    if !dir.is_dir() {
        return Err(AclError::InvalidPolicy(format!(
            "policies directory `{}` does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut all_parsed = Vec::new();
    let mut file_count = 0;

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "kdl")
                .unwrap_or(false)
        })
        .collect();
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        let contents =
            std::fs::read_to_string(&path).map_err(|source| AclError::PolicyLoad {
                path: path.display().to_string(),
                source,
            })?;
        let parsed = parse_kdl_document(&contents)?;
        all_parsed.push(parsed);
        file_count += 1;
    }

    let (registry, seeds) = compile_policies(all_parsed, fallback_default)?;

    tracing::info!(
        files = file_count,
        permissions = registry.permission_names().len(),
        roles = seeds.len(),
        "loaded authorization policies"
    );

    Ok((registry, seeds))
}

/// Merge and validate all parsed policies.
pub fn compile_policies(
    parsed: Vec<ParsedPolicy>,
    fallback_default: &[String],
) -> Result<(Registry, Vec<RoleSeed>), AclError> {
    let mut permissions: HashMap<String, PermissionMeta> = HashMap::new();
    let mut roles: HashMap<String, RoleSeed> = HashMap::new();
    let mut requirements: Vec<RequirementDecl> = Vec::new();
    let mut default_requirement: Option<Vec<String>> = None;

    for p in parsed {
        for (name, meta) in p.permissions {
            permissions.insert(name, meta);
        }
        for seed in p.roles {
            roles.insert(seed.name.clone(), seed);
        }
        requirements.extend(p.requirements);
        if p.default_requirement.is_some() {
            default_requirement = p.default_requirement;
        }
    }

    for seed in roles.values() {
        if !seed.local && !seed.global {
            return Err(AclError::InvalidPolicy(format!(
                "role `{}` is neither local nor global and could never be assigned",
                seed.name
            )));
        }
        for perm in &seed.permissions {
            if !permissions.contains_key(perm) {
                return Err(AclError::InvalidPolicy(format!(
                    "role `{}` references undeclared permission `{perm}`",
                    seed.name
                )));
            }
        }
    }
    for req in &requirements {
        for perm in &req.permissions {
            if !permissions.contains_key(perm) {
                return Err(AclError::InvalidPolicy(format!(
                    "requirement on=\"{}\" operation=\"{}\" references undeclared permission `{perm}`",
                    req.entity_type, req.operation
                )));
            }
        }
    }

    let mut registry = Registry::new(
        default_requirement.unwrap_or_else(|| fallback_default.to_vec()),
    );
    for (name, meta) in permissions {
        registry.register(&name, meta);
    }
    for req in requirements {
        registry.declare_requirement(&req.entity_type, &req.operation, req.permissions);
    }

    let mut seeds: Vec<RoleSeed> = roles.into_values().collect();
    seeds.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((registry, seeds))
}

/// Upsert policy-file role definitions into the roles tables. Changing a
/// role's permission set here never touches assignments: role ids are
/// stable, so the effective-assignment materialization stays valid.
pub async fn sync_roles<C: ConnectionTrait>(
    conn: &C,
    seeds: &[RoleSeed],
) -> Result<(), AclError> {
    for seed in seeds {
        let role_id = match role::Entity::find()
            .filter(role::Column::Name.eq(seed.name.as_str()))
            .one(conn)
            .await?
        {
            Some(existing) => {
                let id = existing.id;
                let mut active: role::ActiveModel = existing.into();
                active.local = Set(seed.local);
                active.global = Set(seed.global);
                active.update(conn).await?;
                id
            }
            None => {
                role::ActiveModel {
                    name: Set(seed.name.clone()),
                    local: Set(seed.local),
                    global: Set(seed.global),
                    created_at: Set(Utc::now().timestamp()),
                    ..Default::default()
                }
                .insert(conn)
                .await?
                .id
            }
        };

        role_permission::Entity::delete_many()
            .filter(role_permission::Column::RoleId.eq(role_id))
            .exec(conn)
            .await?;
        if !seed.permissions.is_empty() {
            let models: Vec<role_permission::ActiveModel> = seed
                .permissions
                .iter()
                .map(|perm| role_permission::ActiveModel {
                    role_id: Set(role_id),
                    permission: Set(perm.clone()),
                })
                .collect();
            role_permission::Entity::insert_many(models)
                .exec_without_returning(conn)
                .await?;
        }
    }
    Ok(())
}

/// Extract the first string argument from a KDL node.
fn first_string_arg(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

/// Extract dash-list children: nodes named "-" whose first argument is a string.
/// Example KDL:
/// ```kdl
/// permissions {
///     - "view"
///     - "modify"
/// }
/// ```
fn dash_list(node: &kdl::KdlNode) -> Vec<String> {
    let Some(children) = node.children() else {
        return Vec::new();
    };
    children
        .nodes()
        .iter()
        .filter(|n| n.name().value() == "-")
        .filter_map(first_string_arg)
        .collect()
}

use sea_orm::entity::prelude::*;

/// Derived cache row. Never written outside the propagation module; the whole
/// table can be regenerated from `assignments` + `edges` + `nodes.blocked`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "effective_assignments")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub role_id: i32,
    pub principal_id: i32,
    pub node_id: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

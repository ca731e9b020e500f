use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Reserved row ids seeded below. The engine relies on these exact values.
const GLOBAL_NODE_ID: i32 = 1;
const ANONYMOUS_PRINCIPAL_ID: i32 = 1;
const UNRESTRICTABLE_PRINCIPAL_ID: i32 = 2;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Enable foreign keys for SQLite
        if manager.get_database_backend() == sea_orm::DatabaseBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await?;
        }

        // Create nodes table
        manager
            .create_table(
                Table::create()
                    .table(Nodes::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Nodes::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string(Nodes::SecurableType))
                    .col(big_integer(Nodes::SecurableId))
                    .col(
                        ColumnDef::new(Nodes::Blocked)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(Nodes::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_nodes_securable")
                    .table(Nodes::Table)
                    .col(Nodes::SecurableType)
                    .col(Nodes::SecurableId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create edges table (parent -> child inheritance paths)
        manager
            .create_table(
                Table::create()
                    .table(Edges::Table)
                    .if_not_exists()
                    .col(integer(Edges::ParentId))
                    .col(integer(Edges::ChildId))
                    .primary_key(Index::create().col(Edges::ParentId).col(Edges::ChildId))
                    .foreign_key(
                        ForeignKey::create()
                            .from(Edges::Table, Edges::ParentId)
                            .to(Nodes::Table, Nodes::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Edges::Table, Edges::ChildId)
                            .to(Nodes::Table, Nodes::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_edges_child")
                    .table(Edges::Table)
                    .col(Edges::ChildId)
                    .to_owned(),
            )
            .await?;

        // Create principals table
        manager
            .create_table(
                Table::create()
                    .table(Principals::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Principals::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string(Principals::SubjectType))
                    .col(big_integer(Principals::SubjectId))
                    .col(big_integer(Principals::CreatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_principals_subject")
                    .table(Principals::Table)
                    .col(Principals::SubjectType)
                    .col(Principals::SubjectId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create roles table
        manager
            .create_table(
                Table::create()
                    .table(Roles::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Roles::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Roles::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Roles::Local)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Roles::Global)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(big_integer(Roles::CreatedAt))
                    .to_owned(),
            )
            .await?;

        // Create role_permissions table
        manager
            .create_table(
                Table::create()
                    .table(RolePermissions::Table)
                    .if_not_exists()
                    .col(integer(RolePermissions::RoleId))
                    .col(string(RolePermissions::Permission))
                    .primary_key(
                        Index::create()
                            .col(RolePermissions::RoleId)
                            .col(RolePermissions::Permission),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(RolePermissions::Table, RolePermissions::RoleId)
                            .to(Roles::Table, Roles::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_role_permissions_permission")
                    .table(RolePermissions::Table)
                    .col(RolePermissions::Permission)
                    .to_owned(),
            )
            .await?;

        // Create assignments table (source of truth for grants)
        manager
            .create_table(
                Table::create()
                    .table(Assignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Assignments::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(integer(Assignments::RoleId))
                    .col(integer(Assignments::PrincipalId))
                    .col(integer(Assignments::NodeId))
                    .col(big_integer(Assignments::CreatedAt))
                    .foreign_key(
                        ForeignKey::create()
                            .from(Assignments::Table, Assignments::RoleId)
                            .to(Roles::Table, Roles::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Assignments::Table, Assignments::PrincipalId)
                            .to(Principals::Table, Principals::Id),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Assignments::Table, Assignments::NodeId)
                            .to(Nodes::Table, Nodes::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_assignments_tuple")
                    .table(Assignments::Table)
                    .col(Assignments::RoleId)
                    .col(Assignments::PrincipalId)
                    .col(Assignments::NodeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Create effective_assignments table (derived inheritance cache)
        manager
            .create_table(
                Table::create()
                    .table(EffectiveAssignments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EffectiveAssignments::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(integer(EffectiveAssignments::RoleId))
                    .col(integer(EffectiveAssignments::PrincipalId))
                    .col(integer(EffectiveAssignments::NodeId))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_effective_assignments_tuple")
                    .table(EffectiveAssignments::Table)
                    .col(EffectiveAssignments::RoleId)
                    .col(EffectiveAssignments::PrincipalId)
                    .col(EffectiveAssignments::NodeId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Seed the global node and the reserved principals
        manager
            .exec_stmt(
                Query::insert()
                    .into_table(Nodes::Table)
                    .columns([
                        Nodes::Id,
                        Nodes::SecurableType,
                        Nodes::SecurableId,
                        Nodes::Blocked,
                        Nodes::CreatedAt,
                    ])
                    .values_panic([
                        GLOBAL_NODE_ID.into(),
                        "global".into(),
                        0i64.into(),
                        false.into(),
                        0i64.into(),
                    ])
                    .to_owned(),
            )
            .await?;

        manager
            .exec_stmt(
                Query::insert()
                    .into_table(Principals::Table)
                    .columns([
                        Principals::Id,
                        Principals::SubjectType,
                        Principals::SubjectId,
                        Principals::CreatedAt,
                    ])
                    .values_panic([
                        ANONYMOUS_PRINCIPAL_ID.into(),
                        "anonymous".into(),
                        0i64.into(),
                        0i64.into(),
                    ])
                    .values_panic([
                        UNRESTRICTABLE_PRINCIPAL_ID.into(),
                        "unrestrictable".into(),
                        0i64.into(),
                        0i64.into(),
                    ])
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(EffectiveAssignments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Assignments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(RolePermissions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Roles::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Principals::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Edges::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Nodes::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Nodes {
    Table,
    Id,
    SecurableType,
    SecurableId,
    Blocked,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Edges {
    Table,
    ParentId,
    ChildId,
}

#[derive(DeriveIden)]
enum Principals {
    Table,
    Id,
    SubjectType,
    SubjectId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Roles {
    Table,
    Id,
    Name,
    Local,
    Global,
    CreatedAt,
}

#[derive(DeriveIden)]
enum RolePermissions {
    Table,
    RoleId,
    Permission,
}

#[derive(DeriveIden)]
enum Assignments {
    Table,
    Id,
    RoleId,
    PrincipalId,
    NodeId,
    CreatedAt,
}

#[derive(DeriveIden)]
enum EffectiveAssignments {
    Table,
    Id,
    RoleId,
    PrincipalId,
    NodeId,
}

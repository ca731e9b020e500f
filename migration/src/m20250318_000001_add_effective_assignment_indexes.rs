use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // The read path filters by (principal, node) and by node alone far more
        // often than by the unique tuple; cover both access patterns.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_effective_assignments_principal_node")
                    .table(EffectiveAssignments::Table)
                    .col(EffectiveAssignments::PrincipalId)
                    .col(EffectiveAssignments::NodeId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_effective_assignments_node")
                    .table(EffectiveAssignments::Table)
                    .col(EffectiveAssignments::NodeId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_assignments_node")
                    .table(Assignments::Table)
                    .col(Assignments::NodeId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_effective_assignments_principal_node")
                    .table(EffectiveAssignments::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_effective_assignments_node")
                    .table(EffectiveAssignments::Table)
                    .to_owned(),
            )
            .await?;
        manager
            .drop_index(
                Index::drop()
                    .name("idx_assignments_node")
                    .table(Assignments::Table)
                    .to_owned(),
            )
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Assignments {
    Table,
    NodeId,
}

#[derive(DeriveIden)]
enum EffectiveAssignments {
    Table,
    PrincipalId,
    NodeId,
}

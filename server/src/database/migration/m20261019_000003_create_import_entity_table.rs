use sea_orm_migration::prelude::*;

use crate::database::entity::import_entity::*;
use crate::database::entity::import_job;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20261019_000003_create_import_entity_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Entity)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Column::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Column::JobId).big_integer().not_null())
                    .col(ColumnDef::new(Column::ParentId).big_integer().null())
                    .col(ColumnDef::new(Column::SourceType).string_len(10).not_null())
                    .col(ColumnDef::new(Column::SourceFullPath).string().not_null())
                    .col(ColumnDef::new(Column::SourceXid).big_integer().null())
                    .col(ColumnDef::new(Column::DestinationName).string().not_null())
                    .col(
                        ColumnDef::new(Column::DestinationNamespace)
                            .string()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Column::LinkedGroupId).big_integer().null())
                    .col(ColumnDef::new(Column::LinkedProjectId).big_integer().null())
                    .col(ColumnDef::new(Column::Status).small_integer().not_null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_import_entity_job")
                            .from_tbl(Entity)
                            .from_col(Column::JobId)
                            .to_tbl(import_job::Entity)
                            .to_col(import_job::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_import_entity_parent")
                            .from_tbl(Entity)
                            .from_col(Column::ParentId)
                            .to_tbl(Entity)
                            .to_col(Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-import-entity-job-status")
                    .table(Entity)
                    .col(Column::JobId)
                    .col(Column::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-import-entity-parent")
                    .table(Entity)
                    .col(Column::ParentId)
                    .to_owned(),
            )
            .await
    }
}

use sea_orm_migration::prelude::*;

use crate::database::entity::export;
use crate::database::entity::export_upload::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20261019_000009_create_export_upload_table"
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
                    .col(ColumnDef::new(Column::ExportId).big_integer().not_null())
                    .col(ColumnDef::new(Column::BatchId).big_integer().null())
                    .col(ColumnDef::new(Column::RemoteFile).string().not_null())
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_export_upload_export")
                            .from_tbl(Entity)
                            .from_col(Column::ExportId)
                            .to_tbl(export::Entity)
                            .to_col(export::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-export-upload-export")
                    .table(Entity)
                    .col(Column::ExportId)
                    .to_owned(),
            )
            .await
    }
}

use sea_orm_migration::prelude::*;

use crate::database::entity::configuration::*;
use crate::database::entity::import_job;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20261019_000002_create_configuration_table"
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
                    .col(
                        ColumnDef::new(Column::JobId)
                            .big_integer()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Column::EncryptedUrl).text().not_null())
                    .col(ColumnDef::new(Column::EncryptedUrlIv).string().not_null())
                    .col(
                        ColumnDef::new(Column::EncryptedAccessToken)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::EncryptedAccessTokenIv)
                            .string()
                            .not_null(),
                    )
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
                            .name("fk_configuration_job")
                            .from_tbl(Entity)
                            .from_col(Column::JobId)
                            .to_tbl(import_job::Entity)
                            .to_col(import_job::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await
    }
}

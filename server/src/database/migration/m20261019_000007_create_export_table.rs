use sea_orm_migration::prelude::*;

use crate::database::entity::export::*;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20261019_000007_create_export_table"
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
                    .col(ColumnDef::new(Column::ProjectId).big_integer().null())
                    .col(ColumnDef::new(Column::GroupId).big_integer().null())
                    .col(ColumnDef::new(Column::UserId).big_integer().null())
                    .col(ColumnDef::new(Column::Relation).string_len(64).not_null())
                    .col(ColumnDef::new(Column::Status).small_integer().not_null())
                    .col(ColumnDef::new(Column::Error).text().null())
                    .col(
                        ColumnDef::new(Column::Batched)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Column::BatchesCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Column::TotalObjectsCount)
                            .big_integer()
                            .not_null()
                            .default(0),
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
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-export-project-relation")
                    .table(Entity)
                    .col(Column::ProjectId)
                    .col(Column::Relation)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-export-group-relation")
                    .table(Entity)
                    .col(Column::GroupId)
                    .col(Column::Relation)
                    .unique()
                    .to_owned(),
            )
            .await
    }
}

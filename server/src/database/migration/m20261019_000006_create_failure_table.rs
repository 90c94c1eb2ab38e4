use sea_orm_migration::prelude::*;

use crate::database::entity::failure::*;
use crate::database::entity::import_entity;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20261019_000006_create_failure_table"
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
                    .col(ColumnDef::new(Column::EntityId).big_integer().not_null())
                    .col(ColumnDef::new(Column::TrackerId).big_integer().null())
                    .col(ColumnDef::new(Column::Relation).string_len(64).null())
                    .col(ColumnDef::new(Column::ExceptionClass).string().not_null())
                    .col(
                        ColumnDef::new(Column::ExceptionMessage)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Column::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKeyCreateStatement::new()
                            .name("fk_failure_entity")
                            .from_tbl(Entity)
                            .from_col(Column::EntityId)
                            .to_tbl(import_entity::Entity)
                            .to_col(import_entity::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-failure-entity")
                    .table(Entity)
                    .col(Column::EntityId)
                    .to_owned(),
            )
            .await
    }
}

use sea_orm_migration::prelude::*;

use crate::database::entity::batch_tracker::*;
use crate::database::entity::tracker;

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20261019_000005_create_batch_tracker_table"
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
                    .col(ColumnDef::new(Column::TrackerId).big_integer().not_null())
                    .col(ColumnDef::new(Column::BatchNumber).integer().not_null())
                    .col(ColumnDef::new(Column::Status).small_integer().not_null())
                    .col(
                        ColumnDef::new(Column::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Column::Error).text().null())
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
                            .name("fk_batch_tracker_tracker")
                            .from_tbl(Entity)
                            .from_col(Column::TrackerId)
                            .to_tbl(tracker::Entity)
                            .to_col(tracker::Column::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-batch-tracker-tracker-batch-number")
                    .table(Entity)
                    .col(Column::TrackerId)
                    .col(Column::BatchNumber)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-batch-tracker-status-updated-at")
                    .table(Entity)
                    .col(Column::Status)
                    .col(Column::UpdatedAt)
                    .to_owned(),
            )
            .await
    }
}

//! A batch of a relation export.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::entity::prelude::*;

use super::Status;
use ferry::status::ExportStatusCode;

pub type ExportBatchModel = Model;

/// A batch of a relation export.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "export_batch")]
pub struct Model {
    /// Unique numeric ID of the batch.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the export the batch belongs to.
    #[sea_orm(indexed)]
    pub export_id: i64,

    /// The number of the batch.
    pub batch_number: i32,

    /// The status of the batch.
    #[sea_orm(indexed)]
    pub status: Status<ExportStatusCode>,

    /// The error message, if the batch failed.
    pub error: Option<String>,

    /// The number of objects in the batch.
    pub objects_count: i64,

    /// Timestamp when the batch is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the batch is last updated.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::export::Entity",
        from = "Column::ExportId",
        to = "super::export::Column::Id"
    )]
    Export,
}

impl Model {
    /// Returns whether the batch is still being worked on.
    ///
    /// A started batch that has not been updated within the window
    /// is considered abandoned.
    pub fn is_started_and_not_timed_out(&self, now: DateTime<Utc>, window: ChronoDuration) -> bool {
        self.status.0 == ExportStatusCode::Started && self.updated_at > now - window
    }
}

impl Related<super::export::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Export.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

//! A relation export on the source.

use sea_orm::entity::prelude::*;

use super::Status;
use crate::error::{ServerError, ServerResult};
use crate::export::Portable;
use ferry::status::ExportStatusCode;

pub type ExportModel = Model;

/// The export of one relation of one portable.
///
/// Exactly one of `group_id` and `project_id` is set.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "export")]
pub struct Model {
    /// Unique numeric ID of the export.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the exported project.
    #[sea_orm(indexed)]
    pub project_id: Option<i64>,

    /// ID of the exported group.
    #[sea_orm(indexed)]
    pub group_id: Option<i64>,

    /// ID of the user who requested the export.
    pub user_id: Option<i64>,

    /// The name of the relation.
    pub relation: String,

    /// The status of the export.
    pub status: Status<ExportStatusCode>,

    /// The error message, if the export failed.
    pub error: Option<String>,

    /// Whether the relation is exported in batches.
    pub batched: bool,

    /// The number of batches.
    pub batches_count: i32,

    /// The total number of objects across all batches.
    pub total_objects_count: i64,

    /// Timestamp when the export is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the export is last updated.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::export_batch::Entity")]
    ExportBatch,

    #[sea_orm(has_many = "super::export_upload::Entity")]
    ExportUpload,
}

impl Model {
    /// Returns the exported portable.
    pub fn portable(&self) -> ServerResult<Portable> {
        Portable::from_ids(self.group_id, self.project_id).ok_or_else(|| {
            ServerError::validation_error(
                "export must belong to exactly one of a group or a project",
            )
        })
    }
}

impl Related<super::export_batch::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ExportBatch.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

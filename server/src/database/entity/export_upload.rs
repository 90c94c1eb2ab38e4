//! A stored export artifact.

use sea_orm::entity::prelude::*;

use super::Json;
use crate::storage::RemoteFile;

pub type ExportUploadModel = Model;

/// A stored export artifact.
///
/// Non-batched exports have a single artifact with a null `batch_id`.
/// Batched exports have one artifact per batch.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "export_upload")]
pub struct Model {
    /// Unique numeric ID of the upload.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the export the upload belongs to.
    #[sea_orm(indexed)]
    pub export_id: i64,

    /// ID of the batch the upload belongs to.
    pub batch_id: Option<i64>,

    /// The remote file backing the artifact.
    pub remote_file: Json<RemoteFile>,

    /// Timestamp when the upload is created.
    pub created_at: ChronoDateTimeUtc,
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

impl Related<super::export::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Export.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

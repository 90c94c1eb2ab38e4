//! Progress of one batch of a tracker.

use sea_orm::entity::prelude::*;

use super::Status;
use ferry::status::BatchStatus;

pub type BatchTrackerModel = Model;

/// Progress of one batch of a tracker.
///
/// Batches are numbered from 1 and map to pages of the relation.
/// A tracker may only finish once all of its batches are finished,
/// failed, or skipped.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "batch_tracker")]
pub struct Model {
    /// Unique numeric ID of the batch.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the tracker the batch belongs to.
    #[sea_orm(indexed)]
    pub tracker_id: i64,

    /// The number of the batch.
    pub batch_number: i32,

    /// The status of the batch.
    #[sea_orm(indexed)]
    pub status: Status<BatchStatus>,

    /// The number of times the batch has been re-dispatched.
    pub retry_count: i32,

    /// The last error of the batch.
    pub error: Option<String>,

    /// Timestamp when the batch is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the batch is last updated.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::tracker::Entity",
        from = "Column::TrackerId",
        to = "super::tracker::Column::Id"
    )]
    Tracker,
}

impl Related<super::tracker::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tracker.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

//! Progress of one relation of one entity.

use sea_orm::entity::prelude::*;

use super::Status;
use ferry::status::TrackerStatus;

pub type TrackerModel = Model;

/// Progress of one relation of one entity.
///
/// ## Pagination
///
/// Pages of a relation are numbered from 1. `last_page` is the last
/// page that was fetched and persisted, and `next_page` is the page
/// to fetch next. Before the first fetch both are null. After a fetch,
/// a null `next_page` means the source reported no further pages.
///
/// Both cursors only move forward, and only after the page has been
/// persisted, so a crashed worker causes the same page to be fetched
/// again rather than skipped.
///
/// ## Leases
///
/// A worker that starts a tracker holds it until `lease_expires_at`.
/// A started tracker whose lease has expired is considered abandoned
/// and may be reclaimed by another worker.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "tracker")]
pub struct Model {
    /// Unique numeric ID of the tracker.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the entity the tracker belongs to.
    #[sea_orm(indexed)]
    pub entity_id: i64,

    /// The name of the relation.
    pub relation: String,

    /// The stage the relation is imported in.
    pub stage: i32,

    /// The status of the tracker.
    #[sea_orm(indexed)]
    pub status: Status<TrackerStatus>,

    /// The page to fetch next.
    pub next_page: Option<i64>,

    /// The last page fetched and persisted.
    pub last_page: Option<i64>,

    /// Timestamp when the tracker was started.
    pub started_at: Option<ChronoDateTimeUtc>,

    /// Timestamp when the lease of the current worker expires.
    pub lease_expires_at: Option<ChronoDateTimeUtc>,

    /// Timestamp when the tracker is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the tracker is last updated.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::import_entity::Entity",
        from = "Column::EntityId",
        to = "super::import_entity::Column::Id"
    )]
    ImportEntity,

    #[sea_orm(has_many = "super::batch_tracker::Entity")]
    BatchTracker,
}

impl Model {
    /// Returns whether more pages remain to be fetched.
    pub fn has_next_page(&self) -> bool {
        self.last_page.is_none() || self.next_page.is_some()
    }

    /// Returns the page to fetch next, if any.
    pub fn page_to_fetch(&self) -> Option<i64> {
        match (self.last_page, self.next_page) {
            (None, None) => Some(1),
            (_, next) => next,
        }
    }
}

impl Related<super::import_entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ImportEntity.def()
    }
}

impl Related<super::batch_tracker::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BatchTracker.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

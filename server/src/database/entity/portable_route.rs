//! The full path of a group or project on the source.

use sea_orm::entity::prelude::*;

use crate::error::{ServerError, ServerResult};
use crate::export::Portable;

pub type PortableRouteModel = Model;

/// Maps a full path to the group or project it names.
///
/// Groups and projects share one namespace, so a full path names
/// at most one of them.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "portable_route")]
pub struct Model {
    /// Unique numeric ID of the route.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the named project.
    pub project_id: Option<i64>,

    /// ID of the named group.
    pub group_id: Option<i64>,

    /// The full path, like `parent/child`.
    #[sea_orm(unique)]
    pub full_path: String,

    /// Timestamp when the route is created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl Model {
    /// Returns the named portable.
    pub fn portable(&self) -> ServerResult<Portable> {
        Portable::from_ids(self.group_id, self.project_id).ok_or_else(|| {
            ServerError::validation_error("route must name exactly one of a group or a project")
        })
    }
}

impl ActiveModelBehavior for ActiveModel {}

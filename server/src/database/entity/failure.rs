//! An error recorded against an entity.

use sea_orm::entity::prelude::*;

pub type FailureModel = Model;

/// Maximum length of a stored exception message.
pub const MAX_MESSAGE_LENGTH: usize = 255;

/// An error recorded against an entity.
///
/// Failures are append-only.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "failure")]
pub struct Model {
    /// Unique numeric ID of the failure.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the entity the failure belongs to.
    #[sea_orm(indexed)]
    pub entity_id: i64,

    /// ID of the tracker that failed, if any.
    pub tracker_id: Option<i64>,

    /// The relation being processed, if any.
    pub relation: Option<String>,

    /// The kind of the error.
    pub exception_class: String,

    /// The error message, truncated.
    pub exception_message: String,

    /// Timestamp when the failure is recorded.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::import_entity::Entity",
        from = "Column::EntityId",
        to = "super::import_entity::Column::Id"
    )]
    ImportEntity,
}

impl Related<super::import_entity::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ImportEntity.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

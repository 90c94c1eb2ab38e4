//! A group or project being migrated.

use sea_orm::entity::prelude::*;

use super::Status;
use ferry::relation::PortableType;
use ferry::status::EntityStatus;

pub type ImportEntityModel = Model;

/// The type of a migrated object.
#[derive(EnumIter, DeriveActiveEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[sea_orm(rs_type = "String", db_type = "String(Some(10))")]
pub enum SourceType {
    #[sea_orm(string_value = "group")]
    Group,

    #[sea_orm(string_value = "project")]
    Project,
}

/// A node in the migration tree.
///
/// One entity exists per group or project discovered under the
/// requested root. Only groups can have children.
///
/// Once the destination object has been created, exactly one of
/// `linked_group_id` and `linked_project_id` is set, matching
/// `source_type`.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "import_entity")]
pub struct Model {
    /// Unique numeric ID of the entity.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the job the entity belongs to.
    #[sea_orm(indexed)]
    pub job_id: i64,

    /// ID of the parent entity.
    #[sea_orm(indexed)]
    pub parent_id: Option<i64>,

    /// The type of the object on the source.
    pub source_type: SourceType,

    /// The full path of the object on the source.
    pub source_full_path: String,

    /// The numeric ID of the object on the source, if known.
    pub source_xid: Option<i64>,

    /// The name of the object on the destination.
    pub destination_name: String,

    /// The full path of the namespace on the destination.
    pub destination_namespace: String,

    /// The group created on the destination.
    pub linked_group_id: Option<i64>,

    /// The project created on the destination.
    pub linked_project_id: Option<i64>,

    /// The status of the entity.
    #[sea_orm(indexed)]
    pub status: Status<EntityStatus>,

    /// Timestamp when the entity is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the entity is last updated.
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::import_job::Entity",
        from = "Column::JobId",
        to = "super::import_job::Column::Id"
    )]
    ImportJob,

    #[sea_orm(
        belongs_to = "Entity",
        from = "Column::ParentId",
        to = "Column::Id"
    )]
    Parent,

    #[sea_orm(has_many = "super::tracker::Entity")]
    Tracker,

    #[sea_orm(has_many = "super::failure::Entity")]
    Failure,
}

impl Model {
    /// Returns the portable type of the entity.
    pub fn portable_type(&self) -> PortableType {
        self.source_type.into()
    }

    /// Returns the path or ID identifying the object in source API calls.
    pub fn source_identifier(&self) -> String {
        match self.source_xid {
            Some(xid) => xid.to_string(),
            None => self.source_full_path.clone(),
        }
    }
}

impl From<SourceType> for PortableType {
    fn from(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Group => Self::Group,
            SourceType::Project => Self::Project,
        }
    }
}

impl From<PortableType> for SourceType {
    fn from(portable_type: PortableType) -> Self {
        match portable_type {
            PortableType::Group => Self::Group,
            PortableType::Project => Self::Project,
        }
    }
}

impl Related<super::import_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ImportJob.def()
    }
}

impl Related<super::tracker::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tracker.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

//! A migration job.

use sea_orm::entity::prelude::*;

pub type ImportJobModel = Model;

/// A migration job.
///
/// A job pulls one or more groups or projects from a single source
/// system, whose credentials are held by the job's configuration.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "import_job")]
pub struct Model {
    /// Unique numeric ID of the job.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Timestamp when the job is created.
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_one = "super::configuration::Entity")]
    Configuration,

    #[sea_orm(has_many = "super::import_entity::Entity")]
    ImportEntity,
}

impl ActiveModelBehavior for ActiveModel {}

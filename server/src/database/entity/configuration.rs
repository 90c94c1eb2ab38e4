//! Credentials of a source system.

use sea_orm::entity::prelude::*;

use crate::error::ServerResult;
use crate::secret::{scrub_url, EncryptionKey};

pub type ConfigurationModel = Model;

/// Credentials of a source system.
///
/// Both attributes are only ever stored encrypted, each with its own IV.
#[derive(Debug, Clone, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "configuration")]
pub struct Model {
    /// Unique numeric ID of the configuration.
    #[sea_orm(primary_key)]
    pub id: i64,

    /// ID of the job the configuration belongs to.
    #[sea_orm(unique, indexed)]
    pub job_id: i64,

    /// Encrypted base URL of the source.
    pub encrypted_url: String,

    /// IV of `encrypted_url`.
    pub encrypted_url_iv: String,

    /// Encrypted access token for the source API.
    pub encrypted_access_token: String,

    /// IV of `encrypted_access_token`.
    pub encrypted_access_token_iv: String,

    /// Timestamp when the configuration is created.
    pub created_at: ChronoDateTimeUtc,

    /// Timestamp when the configuration is last updated.
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
}

impl Model {
    /// Decrypts the URL of the source.
    pub fn url(&self, key: &EncryptionKey) -> ServerResult<String> {
        key.decrypt(&self.encrypted_url, &self.encrypted_url_iv)
    }

    /// Decrypts the access token.
    pub fn access_token(&self, key: &EncryptionKey) -> ServerResult<String> {
        key.decrypt(&self.encrypted_access_token, &self.encrypted_access_token_iv)
    }

    /// Returns the URL of the source with credentials removed.
    ///
    /// This is the only form of the URL that may be logged.
    pub fn safe_url(&self, key: &EncryptionKey) -> ServerResult<String> {
        let url = self.url(key)?;
        let access_token = self.access_token(key)?;

        Ok(scrub_url(&url, &access_token))
    }
}

impl Related<super::import_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ImportJob.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

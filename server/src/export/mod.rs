//! Relation exports on the source side.
//!
//! An export serializes one relation of one portable into a
//! downloadable artifact. Large relations are split into batches,
//! each with its own artifact, which the destination downloads one
//! per page.

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::database::entity::export::ExportModel;
use crate::database::entity::export_batch::ExportBatchModel;
use crate::database::export::ExportDatabase;
use crate::database::Applied;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::storage::{Download, StorageBackend};
use ferry::api::v1::export_relations::{BatchExportStatus, DownloadQuery, RelationExportStatus};
use ferry::relation::{PortableType, RelationRegistry};
use ferry::status::{ExportEvent, ExportStatusCode};

/// Longest full path a route can have.
const MAX_FULL_PATH_LENGTH: usize = 255;

/// A group or project on the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Portable {
    Group(i64),
    Project(i64),
}

/// Aggregations of user contributions that depend on exported data.
#[async_trait]
pub trait UserContributionsCache: Send + Sync {
    /// Drops any cached aggregation of user contributions to a portable.
    async fn invalidate(&self, portable: Portable) -> ServerResult<()>;
}

/// A cache that holds nothing.
#[derive(Debug, Default)]
pub struct NoopUserContributionsCache;

/// An artifact ready to be sent.
pub struct ExportDownload {
    /// The artifact stream.
    pub stream: Download,

    /// The file name presented to clients.
    pub filename: String,

    /// The page following this one, for batched exports.
    pub next_page: Option<i32>,
}

/// The export lifecycle.
#[derive(Clone)]
pub struct ExportService {
    database: DatabaseConnection,
    storage: Arc<Box<dyn StorageBackend>>,
    registry: Arc<dyn RelationRegistry>,
    contributions: Arc<dyn UserContributionsCache>,
    batch_size: i64,
}

impl Portable {
    /// Resolves a portable from its nullable foreign keys.
    ///
    /// Returns `None` unless exactly one is set.
    pub fn from_ids(group_id: Option<i64>, project_id: Option<i64>) -> Option<Self> {
        match (group_id, project_id) {
            (Some(id), None) => Some(Self::Group(id)),
            (None, Some(id)) => Some(Self::Project(id)),
            _ => None,
        }
    }

    pub fn new(portable_type: PortableType, id: i64) -> Self {
        match portable_type {
            PortableType::Group => Self::Group(id),
            PortableType::Project => Self::Project(id),
        }
    }

    /// Returns the foreign keys as `(group_id, project_id)`.
    pub fn ids(&self) -> (Option<i64>, Option<i64>) {
        match self {
            Self::Group(id) => (Some(*id), None),
            Self::Project(id) => (None, Some(*id)),
        }
    }

    pub fn portable_type(&self) -> PortableType {
        match self {
            Self::Group(_) => PortableType::Group,
            Self::Project(_) => PortableType::Project,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Self::Group(id) | Self::Project(id) => *id,
        }
    }
}

impl fmt::Display for Portable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.portable_type(), self.id())
    }
}

#[async_trait]
impl UserContributionsCache for NoopUserContributionsCache {
    async fn invalidate(&self, _portable: Portable) -> ServerResult<()> {
        Ok(())
    }
}

impl ExportService {
    pub fn new(
        database: DatabaseConnection,
        storage: Arc<Box<dyn StorageBackend>>,
        registry: Arc<dyn RelationRegistry>,
        contributions: Arc<dyn UserContributionsCache>,
        batch_size: i64,
    ) -> Self {
        Self {
            database,
            storage,
            registry,
            contributions,
            batch_size: batch_size.max(1),
        }
    }

    /// Records the full path of a portable.
    pub async fn register_route(&self, portable: Portable, full_path: &str) -> ServerResult<()> {
        let full_path = full_path.trim_matches('/');
        if full_path.is_empty() || full_path.len() > MAX_FULL_PATH_LENGTH {
            return Err(ServerError::validation_error(format!(
                "invalid full path of {}",
                portable
            )));
        }

        self.database.register_route(portable, full_path).await
    }

    /// Resolves the identifier of a portable in an API path.
    ///
    /// Numeric identifiers are IDs. Anything else is a full path.
    pub async fn resolve(
        &self,
        portable_type: PortableType,
        identifier: &str,
    ) -> ServerResult<Portable> {
        if let Ok(id) = identifier.parse::<i64>() {
            return Ok(Portable::new(portable_type, id));
        }

        let route = self
            .database
            .find_route(identifier.trim_matches('/'))
            .await?
            .ok_or(ErrorKind::NoSuchPortable)?;

        match route.portable()? {
            portable if portable.portable_type() == portable_type => Ok(portable),
            _ => Err(ErrorKind::NoSuchPortable.into()),
        }
    }

    /// Returns an error unless the relation can be exported from the portable.
    pub fn validate_relation(&self, portable: Portable, relation: &str) -> ServerResult<()> {
        if self.registry.is_exportable(portable.portable_type(), relation) {
            Ok(())
        } else {
            Err(ServerError::validation_error(format!(
                "{} is not an exportable relation of a {}",
                relation,
                portable.portable_type()
            )))
        }
    }

    /// Starts, or restarts, the export of a relation.
    ///
    /// The artifacts of a previous run are removed first.
    pub async fn start(
        &self,
        portable: Portable,
        relation: &str,
        user_id: Option<i64>,
    ) -> ServerResult<ExportModel> {
        self.validate_relation(portable, relation)?;

        if let Some(existing) = self.database.find_export(portable, relation).await? {
            self.remove_existing_upload(existing.id).await?;
        }

        let export = self
            .database
            .create_or_restart_export(portable, relation, user_id)
            .await?;

        tracing::info!("Started export of {} of {}", relation, portable);

        Ok(export)
    }

    /// Marks an export finished.
    ///
    /// If the relation carries user-authored content, cached user
    /// contributions to the portable are invalidated.
    pub async fn finish(&self, export: &ExportModel) -> ServerResult<Applied<ExportStatusCode>> {
        let portable = export.portable()?;
        let applied = self
            .database
            .transition_export(export.id, ExportEvent::Finish, None)
            .await?;

        if applied.is_changed()
            && self
                .registry
                .relation_has_user_contributions(portable.portable_type(), &export.relation)
        {
            self.contributions.invalidate(portable).await?;
        }

        Ok(applied)
    }

    /// Marks an export failed.
    pub async fn fail_op(
        &self,
        export: &ExportModel,
        error: &str,
    ) -> ServerResult<Applied<ExportStatusCode>> {
        tracing::warn!("Export {} of {} failed: {}", export.id, export.relation, error);

        self.database
            .transition_export(export.id, ExportEvent::FailOp, Some(error.to_string()))
            .await
    }

    /// Splits an export into batches of at most `batch-size` objects.
    ///
    /// Only relations defined as batchable can be split.
    pub async fn plan_batches(
        &self,
        export: &ExportModel,
        total_objects: i64,
    ) -> ServerResult<Vec<ExportBatchModel>> {
        let portable = export.portable()?;
        let batchable = self
            .registry
            .relation_definition(portable.portable_type(), &export.relation)
            .map(|def| def.batchable)
            .unwrap_or(false);

        if !batchable {
            return Err(ServerError::validation_error(format!(
                "{} of a {} is not exported in batches",
                export.relation,
                portable.portable_type()
            )));
        }

        let counts = batch_sizes(total_objects, self.batch_size);
        let batches_count = i32::try_from(counts.len())
            .map_err(|_| ServerError::validation_error("too many batches"))?;

        self.database
            .set_export_batching(export.id, batches_count, total_objects)
            .await?;

        self.database.create_export_batches(export.id, &counts).await
    }

    /// Marks a batch finished, finishing the export with its last batch.
    pub async fn finish_batch(
        &self,
        export: &ExportModel,
        batch: &ExportBatchModel,
    ) -> ServerResult<Applied<ExportStatusCode>> {
        let applied = self
            .database
            .transition_export_batch(batch.id, ExportEvent::Finish, None)
            .await?;

        self.reconcile(export).await?;

        Ok(applied)
    }

    /// Marks a batch failed.
    pub async fn fail_batch(
        &self,
        export: &ExportModel,
        batch: &ExportBatchModel,
        error: &str,
    ) -> ServerResult<Applied<ExportStatusCode>> {
        let applied = self
            .database
            .transition_export_batch(batch.id, ExportEvent::FailOp, Some(error.to_string()))
            .await?;

        self.reconcile(export).await?;

        Ok(applied)
    }

    /// Settles a batched export once none of its batches is running.
    ///
    /// The export finishes if every batch finished, and fails if any
    /// batch failed.
    pub async fn reconcile(&self, export: &ExportModel) -> ServerResult<()> {
        let batches = self.database.export_batches(export.id).await?;

        if batches.is_empty()
            || batches
                .iter()
                .any(|b| b.status.0 == ExportStatusCode::Started)
        {
            return Ok(());
        }

        let failed: Vec<i32> = batches
            .iter()
            .filter(|b| b.status.0 == ExportStatusCode::Failed)
            .map(|b| b.batch_number)
            .collect();

        if failed.is_empty() {
            self.finish(export).await?;
        } else {
            let error = format!("Batches {:?} failed", failed);
            self.fail_op(export, &error).await?;
        }

        Ok(())
    }

    /// Stores the artifact of an export, or of one of its batches.
    pub async fn attach_upload(
        &self,
        export: &ExportModel,
        batch: Option<&ExportBatchModel>,
        stream: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ServerResult<()> {
        let name = format!("{}.ndjson.gz", Uuid::new_v4());
        let remote_file = self.storage.upload_file(name, stream).await?;

        self.database
            .create_upload(export.id, batch.map(|b| b.id), remote_file)
            .await?;

        Ok(())
    }

    /// Removes all artifacts of an export.
    ///
    /// Removing the artifacts of an export that has none is a no-op.
    pub async fn remove_existing_upload(&self, export_id: i64) -> ServerResult<()> {
        let uploads = self.database.delete_uploads(export_id).await?;

        for upload in uploads {
            self.storage.delete_file_db(&upload.remote_file.0).await?;
        }

        Ok(())
    }

    /// Returns the status of the exports of a portable.
    pub async fn statuses(
        &self,
        portable: Portable,
        relation: Option<&str>,
    ) -> ServerResult<Vec<RelationExportStatus>> {
        let exports = match relation {
            Some(relation) => self
                .database
                .find_export(portable, relation)
                .await?
                .into_iter()
                .collect(),
            None => self.database.exports_for_portable(portable).await?,
        };

        let mut statuses = Vec::with_capacity(exports.len());
        for export in exports {
            let batches = if export.batched {
                self.database
                    .export_batches(export.id)
                    .await?
                    .into_iter()
                    .map(|b| BatchExportStatus {
                        batch_number: b.batch_number,
                        status: b.status.0,
                        error: b.error,
                        objects_count: b.objects_count,
                        updated_at: Some(b.updated_at),
                    })
                    .collect()
            } else {
                Vec::new()
            };

            statuses.push(RelationExportStatus {
                relation: export.relation,
                status: export.status.0,
                error: export.error,
                batched: export.batched,
                batches_count: export.batches_count,
                total_objects_count: export.total_objects_count,
                batches,
                updated_at: Some(export.updated_at),
            });
        }

        Ok(statuses)
    }

    /// Opens the artifact requested by a download.
    pub async fn open_download(
        &self,
        portable: Portable,
        query: &DownloadQuery,
    ) -> ServerResult<ExportDownload> {
        self.validate_relation(portable, query.relation.as_str())?;

        let export = self
            .database
            .find_export(portable, query.relation.as_str())
            .await?
            .ok_or(ErrorKind::NoSuchExport)?;

        let filename = format!("{}.ndjson.gz", export.relation);

        if query.batched {
            let batch_number = query.batch_number.unwrap_or(0);
            let batch = self
                .database
                .find_export_batch(export.id, batch_number)
                .await?
                .ok_or(ErrorKind::BatchNotFound)?;

            let upload = self
                .database
                .find_upload(export.id, Some(batch.id))
                .await?
                .ok_or(ErrorKind::BatchFileNotFound)?;

            let stream = self
                .storage
                .download_file_db(&upload.remote_file.0)
                .await?
                .ok_or(ErrorKind::BatchFileNotFound)?;

            let next_page = if batch_number < export.batches_count {
                Some(batch_number + 1)
            } else {
                None
            };

            Ok(ExportDownload {
                stream,
                filename,
                next_page,
            })
        } else {
            if export.batched {
                return Err(ErrorKind::ExportIsBatched.into());
            }

            let upload = self
                .database
                .find_upload(export.id, None)
                .await?
                .ok_or(ErrorKind::NotFound)?;

            let stream = self
                .storage
                .download_file_db(&upload.remote_file.0)
                .await?
                .ok_or(ErrorKind::NotFound)?;

            Ok(ExportDownload {
                stream,
                filename,
                next_page: None,
            })
        }
    }

    /// Fails the exports whose batches were abandoned.
    ///
    /// Started batches not updated within `window` are failed, then
    /// their exports are reconciled.
    pub async fn reap_stale_batches(&self, window: chrono::Duration) -> ServerResult<usize> {
        let now = Utc::now();
        let stale = self.database.stale_export_batches(now - window).await?;
        let mut reaped = 0;
        let mut exports = Vec::new();

        for batch in stale {
            // An exporter may have reported progress since the listing
            let current = self
                .database
                .find_export_batch(batch.export_id, batch.batch_number)
                .await?;
            if current.map_or(true, |b| b.is_started_and_not_timed_out(now, window)) {
                continue;
            }

            let applied = self
                .database
                .transition_export_batch(
                    batch.id,
                    ExportEvent::FailOp,
                    Some("Batch export timed out".to_string()),
                )
                .await?;

            if applied.is_changed() {
                reaped += 1;
            }

            if !exports.contains(&batch.export_id) {
                exports.push(batch.export_id);
            }
        }

        for export_id in exports {
            if let Some(export) = self.database.find_export_by_id(export_id).await? {
                self.reconcile(&export).await?;
            }
        }

        Ok(reaped)
    }
}

/// Splits `total` objects into batches of at most `batch_size`.
fn batch_sizes(total: i64, batch_size: i64) -> Vec<i64> {
    let mut sizes = Vec::new();
    let mut remaining = total.max(0);

    while remaining > 0 {
        let size = remaining.min(batch_size);
        sizes.push(size);
        remaining -= size;
    }

    sizes
}

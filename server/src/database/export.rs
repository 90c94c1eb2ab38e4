//! Source-side export persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::query::QueryOrder;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue::Set, Condition, DatabaseConnection, TransactionTrait};

use super::entity::export::{self, Entity as Export, ExportModel};
use super::entity::export_batch::{self, Entity as ExportBatch, ExportBatchModel};
use super::entity::export_upload::{self, Entity as ExportUpload, ExportUploadModel};
use super::entity::portable_route::{self, Entity as PortableRoute, PortableRouteModel};
use super::entity::{Json, Status};
use super::{apply_transition, Applied, StatusTable};
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::export::Portable;
use crate::storage::RemoteFile;
use ferry::status::{ExportEvent, ExportStatusCode};

impl StatusTable for Export {
    type State = ExportStatusCode;

    const ID: Self::Column = export::Column::Id;
    const STATUS: Self::Column = export::Column::Status;
    const UPDATED_AT: Self::Column = export::Column::UpdatedAt;

    fn not_found() -> ErrorKind {
        ErrorKind::NoSuchExport
    }
}

impl StatusTable for ExportBatch {
    type State = ExportStatusCode;

    const ID: Self::Column = export_batch::Column::Id;
    const STATUS: Self::Column = export_batch::Column::Status;
    const UPDATED_AT: Self::Column = export_batch::Column::UpdatedAt;

    fn not_found() -> ErrorKind {
        ErrorKind::BatchNotFound
    }
}

#[async_trait]
pub trait ExportDatabase: Send + Sync {
    /// Retrieves the export of a relation of a portable.
    async fn find_export(
        &self,
        portable: Portable,
        relation: &str,
    ) -> ServerResult<Option<ExportModel>>;

    /// Retrieves an export by ID.
    async fn find_export_by_id(&self, export_id: i64) -> ServerResult<Option<ExportModel>>;

    /// Lists all exports of a portable.
    async fn exports_for_portable(&self, portable: Portable) -> ServerResult<Vec<ExportModel>>;

    /// Creates an export in the started state, or restarts an existing one.
    ///
    /// Restarting clears the error and the batching information, and
    /// removes the batches of the previous run.
    async fn create_or_restart_export(
        &self,
        portable: Portable,
        relation: &str,
        user_id: Option<i64>,
    ) -> ServerResult<ExportModel>;

    /// Applies an event to an export, recording an error message if given.
    async fn transition_export(
        &self,
        export_id: i64,
        event: ExportEvent,
        error: Option<String>,
    ) -> ServerResult<Applied<ExportStatusCode>>;

    /// Records how an export is split into batches.
    async fn set_export_batching(
        &self,
        export_id: i64,
        batches_count: i32,
        total_objects_count: i64,
    ) -> ServerResult<()>;

    /// Creates batches in the started state, one per object count.
    async fn create_export_batches(
        &self,
        export_id: i64,
        objects_counts: &[i64],
    ) -> ServerResult<Vec<ExportBatchModel>>;

    /// Lists the batches of an export in order.
    async fn export_batches(&self, export_id: i64) -> ServerResult<Vec<ExportBatchModel>>;

    /// Retrieves one batch of an export.
    async fn find_export_batch(
        &self,
        export_id: i64,
        batch_number: i32,
    ) -> ServerResult<Option<ExportBatchModel>>;

    /// Applies an event to an export batch.
    async fn transition_export_batch(
        &self,
        batch_id: i64,
        event: ExportEvent,
        error: Option<String>,
    ) -> ServerResult<Applied<ExportStatusCode>>;

    /// Lists started batches not updated since `cutoff`.
    async fn stale_export_batches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ServerResult<Vec<ExportBatchModel>>;

    /// Retrieves the artifact of an export or one of its batches.
    async fn find_upload(
        &self,
        export_id: i64,
        batch_id: Option<i64>,
    ) -> ServerResult<Option<ExportUploadModel>>;

    /// Records a stored artifact.
    async fn create_upload(
        &self,
        export_id: i64,
        batch_id: Option<i64>,
        remote_file: RemoteFile,
    ) -> ServerResult<ExportUploadModel>;

    /// Detaches all artifacts of an export, returning them.
    async fn delete_uploads(&self, export_id: i64) -> ServerResult<Vec<ExportUploadModel>>;

    /// Points a full path at a portable, replacing any previous route.
    async fn register_route(&self, portable: Portable, full_path: &str) -> ServerResult<()>;

    /// Retrieves the route of a full path.
    async fn find_route(&self, full_path: &str) -> ServerResult<Option<PortableRouteModel>>;
}

fn portable_filter(portable: Portable) -> Condition {
    match portable {
        Portable::Group(id) => Condition::all()
            .add(export::Column::GroupId.eq(id))
            .add(export::Column::ProjectId.is_null()),
        Portable::Project(id) => Condition::all()
            .add(export::Column::ProjectId.eq(id))
            .add(export::Column::GroupId.is_null()),
    }
}

#[async_trait]
impl ExportDatabase for DatabaseConnection {
    async fn find_export(
        &self,
        portable: Portable,
        relation: &str,
    ) -> ServerResult<Option<ExportModel>> {
        Export::find()
            .filter(portable_filter(portable))
            .filter(export::Column::Relation.eq(relation))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_export_by_id(&self, export_id: i64) -> ServerResult<Option<ExportModel>> {
        Export::find_by_id(export_id)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn exports_for_portable(&self, portable: Portable) -> ServerResult<Vec<ExportModel>> {
        Export::find()
            .filter(portable_filter(portable))
            .order_by_asc(export::Column::Id)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn create_or_restart_export(
        &self,
        portable: Portable,
        relation: &str,
        user_id: Option<i64>,
    ) -> ServerResult<ExportModel> {
        let now = Utc::now();
        let txn = self.begin().await.map_err(ServerError::database_error)?;

        let existing = Export::find()
            .filter(portable_filter(portable))
            .filter(export::Column::Relation.eq(relation))
            .one(&txn)
            .await
            .map_err(ServerError::database_error)?;

        let model = if let Some(existing) = existing {
            ExportBatch::delete_many()
                .filter(export_batch::Column::ExportId.eq(existing.id))
                .exec(&txn)
                .await
                .map_err(ServerError::database_error)?;

            let mut model: export::ActiveModel = existing.into();
            model.user_id = Set(user_id);
            model.status = Set(Status(ExportStatusCode::Started));
            model.error = Set(None);
            model.batched = Set(false);
            model.batches_count = Set(0);
            model.total_objects_count = Set(0);
            model.updated_at = Set(now);

            model.update(&txn).await.map_err(ServerError::database_error)?
        } else {
            let (group_id, project_id) = portable.ids();

            let model = export::ActiveModel {
                project_id: Set(project_id),
                group_id: Set(group_id),
                user_id: Set(user_id),
                relation: Set(relation.to_string()),
                status: Set(Status(ExportStatusCode::Started)),
                error: Set(None),
                batched: Set(false),
                batches_count: Set(0),
                total_objects_count: Set(0),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };

            model.insert(&txn).await.map_err(ServerError::database_error)?
        };

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(model)
    }

    async fn transition_export(
        &self,
        export_id: i64,
        event: ExportEvent,
        error: Option<String>,
    ) -> ServerResult<Applied<ExportStatusCode>> {
        let mut update = Export::update_many();

        if let Some(error) = error {
            update = update.col_expr(export::Column::Error, Expr::value(Some(error)));
        } else if event == ExportEvent::Start {
            update = update.col_expr(export::Column::Error, Expr::value(Option::<String>::None));
        }

        apply_transition(self, export_id, event, update).await
    }

    async fn set_export_batching(
        &self,
        export_id: i64,
        batches_count: i32,
        total_objects_count: i64,
    ) -> ServerResult<()> {
        let result = Export::update_many()
            .col_expr(export::Column::Batched, Expr::value(true))
            .col_expr(export::Column::BatchesCount, Expr::value(batches_count))
            .col_expr(
                export::Column::TotalObjectsCount,
                Expr::value(total_objects_count),
            )
            .col_expr(export::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(export::Column::Id.eq(export_id))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        if result.rows_affected == 0 {
            return Err(ErrorKind::NoSuchExport.into());
        }

        Ok(())
    }

    async fn create_export_batches(
        &self,
        export_id: i64,
        objects_counts: &[i64],
    ) -> ServerResult<Vec<ExportBatchModel>> {
        if objects_counts.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let models = objects_counts
            .iter()
            .enumerate()
            .map(|(i, count)| export_batch::ActiveModel {
                export_id: Set(export_id),
                batch_number: Set(i as i32 + 1),
                status: Set(Status(ExportStatusCode::Started)),
                error: Set(None),
                objects_count: Set(*count),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            });

        ExportBatch::insert_many(models)
            .exec_without_returning(self)
            .await
            .map_err(ServerError::database_error)?;

        self.export_batches(export_id).await
    }

    async fn export_batches(&self, export_id: i64) -> ServerResult<Vec<ExportBatchModel>> {
        ExportBatch::find()
            .filter(export_batch::Column::ExportId.eq(export_id))
            .order_by_asc(export_batch::Column::BatchNumber)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_export_batch(
        &self,
        export_id: i64,
        batch_number: i32,
    ) -> ServerResult<Option<ExportBatchModel>> {
        ExportBatch::find()
            .filter(export_batch::Column::ExportId.eq(export_id))
            .filter(export_batch::Column::BatchNumber.eq(batch_number))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn transition_export_batch(
        &self,
        batch_id: i64,
        event: ExportEvent,
        error: Option<String>,
    ) -> ServerResult<Applied<ExportStatusCode>> {
        let mut update = ExportBatch::update_many();

        if let Some(error) = error {
            update = update.col_expr(export_batch::Column::Error, Expr::value(Some(error)));
        }

        apply_transition(self, batch_id, event, update).await
    }

    async fn stale_export_batches(
        &self,
        cutoff: DateTime<Utc>,
    ) -> ServerResult<Vec<ExportBatchModel>> {
        ExportBatch::find()
            .filter(export_batch::Column::Status.eq(Status(ExportStatusCode::Started)))
            .filter(export_batch::Column::UpdatedAt.lt(cutoff))
            .order_by_asc(export_batch::Column::Id)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_upload(
        &self,
        export_id: i64,
        batch_id: Option<i64>,
    ) -> ServerResult<Option<ExportUploadModel>> {
        let batch_filter = match batch_id {
            Some(batch_id) => export_upload::Column::BatchId.eq(batch_id),
            None => export_upload::Column::BatchId.is_null(),
        };

        ExportUpload::find()
            .filter(export_upload::Column::ExportId.eq(export_id))
            .filter(batch_filter)
            .order_by_desc(export_upload::Column::Id)
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn create_upload(
        &self,
        export_id: i64,
        batch_id: Option<i64>,
        remote_file: RemoteFile,
    ) -> ServerResult<ExportUploadModel> {
        let model = export_upload::ActiveModel {
            export_id: Set(export_id),
            batch_id: Set(batch_id),
            remote_file: Set(Json(remote_file)),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        model.insert(self).await.map_err(ServerError::database_error)
    }

    async fn delete_uploads(&self, export_id: i64) -> ServerResult<Vec<ExportUploadModel>> {
        let txn = self.begin().await.map_err(ServerError::database_error)?;

        let uploads = ExportUpload::find()
            .filter(export_upload::Column::ExportId.eq(export_id))
            .all(&txn)
            .await
            .map_err(ServerError::database_error)?;

        ExportUpload::delete_many()
            .filter(export_upload::Column::ExportId.eq(export_id))
            .exec(&txn)
            .await
            .map_err(ServerError::database_error)?;

        txn.commit().await.map_err(ServerError::database_error)?;

        Ok(uploads)
    }

    async fn register_route(&self, portable: Portable, full_path: &str) -> ServerResult<()> {
        let (group_id, project_id) = portable.ids();

        let model = portable_route::ActiveModel {
            project_id: Set(project_id),
            group_id: Set(group_id),
            full_path: Set(full_path.to_string()),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        PortableRoute::insert(model)
            .on_conflict(
                OnConflict::column(portable_route::Column::FullPath)
                    .update_columns([
                        portable_route::Column::ProjectId,
                        portable_route::Column::GroupId,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn find_route(&self, full_path: &str) -> ServerResult<Option<PortableRouteModel>> {
        PortableRoute::find()
            .filter(portable_route::Column::FullPath.eq(full_path))
            .one(self)
            .await
            .map_err(ServerError::database_error)
    }
}

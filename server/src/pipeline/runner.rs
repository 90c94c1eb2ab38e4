//! Running a single tracker.

use chrono::Utc;
use tracing::instrument;

use super::export_status::ExportStatus;
use super::{chrono_duration, Pipeline};
use crate::database::entity::import_entity::ImportEntityModel;
use crate::database::entity::tracker::TrackerModel;
use crate::database::{Applied, NewFailure, PageAdvance, PipelineDatabase};
use crate::error::{ErrorKind, ServerResult};
use crate::source::relation::{FetchError, RelationSource};
use ferry::relation::SELF_RELATION;
use ferry::state::StateMachine;
use ferry::status::{
    BatchEvent, EntityEvent, EntityStatus, ExportStatusCode, TrackerEvent, TrackerStatus,
};

/// What became of a tracker after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every page was persisted and the tracker is finished.
    Finished,

    /// The tracker failed and a failure was recorded.
    Failed,

    /// The relation does not apply on the source.
    Skipped,

    /// The tracker is waiting on something and was handed back.
    Deferred,

    /// The tracker was settled by someone else mid-run, and the
    /// page in flight was thrown away.
    Discarded,
}

impl Pipeline {
    /// Runs a claimed tracker as far as it can go.
    #[instrument(skip_all, fields(tracker_id = tracker.id, relation = %tracker.relation))]
    pub async fn run_tracker(&self, tracker: TrackerModel) -> ServerResult<RunOutcome> {
        let entity = self.database.find_entity(tracker.entity_id).await?;

        if !self.database.stage_gate_open(&tracker).await? {
            self.database.release_lease(tracker.id).await?;
            return Ok(RunOutcome::Deferred);
        }

        let client = self.connector.connect(entity.job_id).await?;
        let status = ExportStatus::new(
            client.clone(),
            self.config.retry.clone(),
            entity.portable_type(),
            entity.source_identifier(),
            tracker.relation.as_str(),
        );

        if status.unavailable().await {
            let error = status.error().await.unwrap_or_default();
            return self.wait(&entity, &tracker, &error).await;
        }

        if status.failed().await {
            let error = status
                .error()
                .await
                .unwrap_or_else(|| "Export failed on the source".to_string());
            return self.fail(&entity, &tracker, "ExportFailed", &error).await;
        }

        let batched = status.batched().await;
        let exporting = status.started().await;
        let relation_source = RelationSource::new(client.as_ref(), &self.config.retry);
        let mut tracker = tracker;

        while let Some(page) = tracker.page_to_fetch() {
            let batch_number = i32::try_from(page).map_err(|_| {
                ErrorKind::RequestError(anyhow::anyhow!("Page {} is out of range", page))
            })?;

            if batched {
                if !exporting && batch_number > status.batches_count().await {
                    break;
                }

                match status.batch(batch_number).await {
                    Some(b) if b.status == ExportStatusCode::Started => {
                        return self.wait(&entity, &tracker, "Batch is still exporting").await;
                    }
                    Some(b) if b.status == ExportStatusCode::Failed => {
                        let error = b
                            .error
                            .unwrap_or_else(|| format!("Batch {} failed", batch_number));
                        return self.fail(&entity, &tracker, "ExportFailed", &error).await;
                    }
                    _ => {}
                }
            }

            let batch = if batched {
                let batch = self
                    .database
                    .find_or_create_batch(tracker.id, batch_number)
                    .await?;
                self.database
                    .transition_batch(batch.id, BatchEvent::Start, None)
                    .await?;
                Some(batch)
            } else {
                None
            };

            let fetched = match relation_source
                .fetch_page(
                    entity.portable_type(),
                    &entity.source_identifier(),
                    &tracker.relation,
                    batched,
                    page,
                )
                .await
            {
                Ok(fetched) => fetched,
                Err(FetchError::Transient(e)) => {
                    if let Some(batch) = &batch {
                        self.database.retry_batch(batch.id).await?;
                    }
                    return self.wait(&entity, &tracker, &e.to_string()).await;
                }
                Err(FetchError::Missing(e)) if exporting => {
                    // The source has not produced the page yet
                    if let Some(batch) = &batch {
                        self.database.retry_batch(batch.id).await?;
                    }
                    return self.wait(&entity, &tracker, &e).await;
                }
                Err(FetchError::Changed(e)) => {
                    // Read the status again on the next run
                    if let Some(batch) = &batch {
                        self.database.retry_batch(batch.id).await?;
                    }
                    return self.wait(&entity, &tracker, &e).await;
                }
                Err(FetchError::NotApplicable(e)) => {
                    tracing::info!("Skipping {}: {}", tracker.relation, e);
                    if let Some(batch) = &batch {
                        self.database
                            .transition_batch(batch.id, BatchEvent::Skip, None)
                            .await?;
                    }
                    self.database
                        .transition_tracker(tracker.id, TrackerEvent::Skip)
                        .await?;
                    self.try_complete_entity(entity.id).await?;
                    return Ok(RunOutcome::Skipped);
                }
                Err(e) => {
                    if let Some(batch) = &batch {
                        self.database
                            .transition_batch(batch.id, BatchEvent::FailOp, Some(e.to_string()))
                            .await?;
                    }
                    return self.fail(&entity, &tracker, e.name(), &e.to_string()).await;
                }
            };

            let current = self.database.find_tracker(tracker.id).await?;
            if current.status.0 != TrackerStatus::Started {
                tracing::info!(
                    "Tracker is {}, discarding page {}",
                    current.status.0.name(),
                    page
                );
                if let Some(batch) = &batch {
                    self.database
                        .transition_batch(batch.id, BatchEvent::Skip, None)
                        .await?;
                }
                return Ok(RunOutcome::Discarded);
            }

            let outcome = match self
                .persister
                .persist(&entity, &tracker.relation, &fetched)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Some(batch) = &batch {
                        self.database
                            .transition_batch(batch.id, BatchEvent::FailOp, Some(e.to_string()))
                            .await?;
                    }
                    return self
                        .fail(&entity, &tracker, "PersistError", &e.to_string())
                        .await;
                }
            };

            if let Some(local_id) = outcome.linked_portable {
                if let Err(e) = self
                    .database
                    .link_portable(entity.id, entity.portable_type(), local_id)
                    .await
                {
                    return self.fail(&entity, &tracker, e.kind().name(), &e.to_string()).await;
                }
            }

            if let Some(batch) = &batch {
                self.database
                    .transition_batch(batch.id, BatchEvent::Finish, None)
                    .await?;
            }

            match self
                .database
                .advance_page(tracker.id, page, fetched.next_page)
                .await
            {
                Ok(PageAdvance::Advanced) => {}
                Ok(PageAdvance::Discarded) => return Ok(RunOutcome::Discarded),
                Err(e) => {
                    return self.fail(&entity, &tracker, e.kind().name(), &e.to_string()).await;
                }
            }

            self.database
                .renew_lease(tracker.id, self.lease_until(Utc::now()))
                .await?;
            tracker = self.database.find_tracker(tracker.id).await?;
        }

        match self.database.finish_tracker(tracker.id).await {
            Ok(applied) => {
                if applied.is_changed() {
                    tracing::info!("Finished {} of {}", tracker.relation, entity.source_full_path);
                    let tracker = self.database.find_tracker(tracker.id).await?;
                    self.hooks.tracker_finished(&entity, &tracker).await;
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::BatchesPending(_)) => {
                tracing::debug!("{}", e);
                self.database.release_lease(tracker.id).await?;
                return Ok(RunOutcome::Deferred);
            }
            Err(e) => return Err(e),
        }

        self.try_complete_entity(entity.id).await?;

        Ok(RunOutcome::Finished)
    }

    /// Settles an entity once none of its trackers has work left.
    ///
    /// The entity fails if the tracker creating the group or project
    /// itself failed. Failures of other relations are recorded but
    /// don't fail the entity.
    pub(crate) async fn try_complete_entity(
        &self,
        entity_id: i64,
    ) -> ServerResult<Option<EntityStatus>> {
        let entity = self.database.find_entity(entity_id).await?;

        if entity.status.0 != EntityStatus::Started
            || !self.database.trackers_settled(entity_id).await?
        {
            return Ok(None);
        }

        let trackers = self.database.trackers_for_entity(entity_id).await?;
        let aborted = trackers
            .iter()
            .any(|t| t.relation == SELF_RELATION && t.status.0 == TrackerStatus::Failed);

        let event = if aborted {
            EntityEvent::FailOp
        } else {
            EntityEvent::Finish
        };

        let applied = self.database.transition_entity(entity_id, event).await?;

        if let Applied::Changed(status) = applied {
            tracing::info!("Entity {} is {}", entity.source_full_path, status.name());

            let entity = self.database.find_entity(entity_id).await?;
            self.hooks.entity_finished(&entity).await;
        }

        Ok(Some(applied.status()))
    }

    /// Hands a tracker back while the source is not ready.
    ///
    /// Gives up once the tracker has been waiting for longer than
    /// the configured export wait timeout.
    async fn wait(
        &self,
        entity: &ImportEntityModel,
        tracker: &TrackerModel,
        reason: &str,
    ) -> ServerResult<RunOutcome> {
        let now = Utc::now();
        let started_at = tracker.started_at.unwrap_or(now);

        if now - started_at > chrono_duration(self.config.export_wait_timeout) {
            let message = format!(
                "Export was not ready after {}: {}",
                humantime::format_duration(self.config.export_wait_timeout),
                reason
            );
            return self.fail(entity, tracker, "ExportTimeout", &message).await;
        }

        tracing::debug!("Waiting on {}: {}", tracker.relation, reason);
        self.database.release_lease(tracker.id).await?;

        Ok(RunOutcome::Deferred)
    }

    /// Fails a tracker, recording why.
    async fn fail(
        &self,
        entity: &ImportEntityModel,
        tracker: &TrackerModel,
        class: &str,
        message: &str,
    ) -> ServerResult<RunOutcome> {
        tracing::warn!(
            "Failed to import {} of {}: {}",
            tracker.relation,
            entity.source_full_path,
            message
        );

        self.database
            .record_failure(NewFailure {
                entity_id: entity.id,
                tracker_id: Some(tracker.id),
                relation: Some(tracker.relation.clone()),
                exception_class: class.to_string(),
                exception_message: message.to_string(),
            })
            .await?;

        self.database
            .transition_tracker(tracker.id, TrackerEvent::FailOp)
            .await?;

        if tracker.relation == SELF_RELATION {
            // Nothing else can land without the group or project
            self.database.skip_open_trackers(entity.id).await?;
        }

        self.try_complete_entity(entity.id).await?;

        Ok(RunOutcome::Failed)
    }
}

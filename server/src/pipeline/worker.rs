//! The worker loop.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::time;
use tracing::instrument;

use super::{Pipeline, RunOutcome};
use crate::database::entity::import_entity::ImportEntityModel;
use crate::database::{NewFailure, PipelineDatabase};
use crate::error::{ErrorKind, ServerResult};
use ferry::state::StateMachine;
use ferry::status::{EntityEvent, EntityStatus};

/// How many entities a pass looks at, per concurrent tracker.
const ENTITIES_PER_SLOT: u64 = 16;

/// How many trackers a pass looks at, per concurrent tracker.
const TRACKERS_PER_SLOT: u64 = 4;

/// What a pass over the work queue did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub entities_started: usize,
    pub entities_failed: usize,
    pub entities_completed: usize,
    pub trackers_run: usize,
    pub trackers_deferred: usize,
}

impl Pipeline {
    /// Runs the pipeline until the process exits.
    pub async fn run_worker(self: Arc<Self>) {
        let interval = self.config.poll_interval;

        loop {
            match self.run_pass().await {
                Ok(summary) if summary != PassSummary::default() => {
                    tracing::debug!("Pass finished: {:?}", summary);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("Pass failed: {}", e),
            }

            time::sleep(interval).await;
        }
    }

    /// Makes one pass over the work queue.
    ///
    /// Starts entities that are ready, settles entities that are
    /// done, then claims and runs trackers concurrently.
    #[instrument(skip_all)]
    pub async fn run_pass(&self) -> ServerResult<PassSummary> {
        let mut summary = PassSummary::default();
        let slots = self.config.concurrency.max(1);

        self.start_ready_entities(slots as u64 * ENTITIES_PER_SLOT, &mut summary)
            .await?;

        for entity in self
            .database
            .entities_with_status(EntityStatus::Started, slots as u64 * ENTITIES_PER_SLOT)
            .await?
        {
            if self.try_complete_entity(entity.id).await?.is_some() {
                summary.entities_completed += 1;
            }
        }

        let mut claimed = Vec::new();

        for tracker in self
            .database
            .claimable_trackers(Utc::now(), slots as u64 * TRACKERS_PER_SLOT)
            .await?
        {
            if !self.database.stage_gate_open(&tracker).await? {
                continue;
            }

            let now = Utc::now();
            if let Some(tracker) = self
                .database
                .claim_tracker(tracker.id, now, self.lease_until(now))
                .await?
            {
                claimed.push(tracker);
            }
        }

        // Claimed trackers hold their lease while waiting for a slot
        let run_limit = Arc::new(Semaphore::new(slots));
        let futures: Vec<_> = claimed
            .into_iter()
            .map(|tracker| {
                let run_limit = run_limit.clone();
                async move {
                    let permit = run_limit
                        .acquire()
                        .await
                        .map_err(|_| ErrorKind::InternalServerError)?;
                    let outcome = self.run_tracker(tracker).await;
                    drop(permit);
                    outcome
                }
            })
            .collect();

        for result in join_all(futures).await {
            match result {
                Ok(RunOutcome::Deferred) => summary.trackers_deferred += 1,
                Ok(_) => summary.trackers_run += 1,
                Err(e) => tracing::warn!("Tracker run failed: {}", e),
            }
        }

        Ok(summary)
    }

    /// Starts root entities, and children whose parent is finished.
    ///
    /// Children of a parent that failed or was canceled can't be
    /// placed on the destination, so they fail too.
    async fn start_ready_entities(
        &self,
        limit: u64,
        summary: &mut PassSummary,
    ) -> ServerResult<()> {
        for entity in self
            .database
            .entities_with_status(EntityStatus::Created, limit)
            .await?
        {
            let parent_status = match entity.parent_id {
                Some(parent_id) => Some(self.database.find_entity(parent_id).await?.status.0),
                None => None,
            };

            match parent_status {
                None | Some(EntityStatus::Finished) => {
                    let applied = self
                        .database
                        .transition_entity(entity.id, EntityEvent::Start)
                        .await?;

                    if applied.is_changed() {
                        tracing::info!("Started entity {}", entity.source_full_path);
                        summary.entities_started += 1;
                    }
                }
                Some(status @ (EntityStatus::Failed | EntityStatus::Canceled)) => {
                    self.fail_orphan(&entity, status).await?;
                    summary.entities_failed += 1;
                }
                Some(_) => {}
            }
        }

        Ok(())
    }

    async fn fail_orphan(
        &self,
        entity: &ImportEntityModel,
        parent_status: EntityStatus,
    ) -> ServerResult<()> {
        self.database
            .record_failure(NewFailure {
                entity_id: entity.id,
                tracker_id: None,
                relation: None,
                exception_class: "ParentFailed".to_string(),
                exception_message: format!("Parent entity is {}", parent_status.name()),
            })
            .await?;

        let applied = self
            .database
            .transition_entity(entity.id, EntityEvent::FailOp)
            .await?;
        self.database.skip_open_trackers(entity.id).await?;

        if applied.is_changed() {
            tracing::warn!(
                "Entity {} failed, its parent is {}",
                entity.source_full_path,
                parent_status.name()
            );

            let entity = self.database.find_entity(entity.id).await?;
            self.hooks.entity_finished(&entity).await;
        }

        Ok(())
    }
}

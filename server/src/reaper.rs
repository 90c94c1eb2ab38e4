//! Stale work reaper.
//!
//! Batches whose worker went away stop receiving updates. The reaper
//! hands them back for another attempt, or times them out so that
//! their tracker can settle.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sea_orm::DatabaseConnection;
use tokio::time;
use tracing::instrument;

use super::StateInner;
use crate::config::Config;
use crate::database::PipelineDatabase;
use crate::error::ServerResult;
use crate::pipeline::chrono_duration;
use ferry::status::{BatchEvent, BatchStatus};

/// Error recorded on batches that were timed out.
const TIMEOUT_ERROR: &str = "Batch was not updated within the stale window";

/// What a reaper run did to batch trackers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapSummary {
    /// Batches handed back for another attempt.
    pub retried: usize,

    /// Batches that were timed out.
    pub timed_out: usize,
}

/// Runs the reaper periodically.
pub async fn run_reaper(config: Config) {
    let interval = config.reaper.interval;

    if interval == Duration::ZERO {
        // disabled
        return;
    }

    loop {
        // We don't stop even if it errors
        if let Err(e) = run_reaper_once(config.clone()).await {
            tracing::warn!("Reaper failed: {}", e);
        }

        time::sleep(interval).await;
    }
}

/// Runs the reaper once.
#[instrument(skip_all)]
pub async fn run_reaper_once(config: Config) -> Result<()> {
    tracing::info!("Running reaper...");

    let state = StateInner::new(config).await;
    let db = state.database().await?;

    let summary = reap_stale_batches(
        db,
        state.config.pipeline.stale_window,
        state.config.reaper.max_batch_retries,
    )
    .await?;

    tracing::info!(
        "Retried {} and timed out {} stale batches",
        summary.retried,
        summary.timed_out
    );

    let failed = state
        .export_service()
        .await?
        .reap_stale_batches(chrono_duration(state.config.export.stale_window))
        .await?;

    tracing::info!("Failed {} stale export batches", failed);

    Ok(())
}

/// Retries or times out batch trackers not updated within `stale_window`.
///
/// A started batch is retried while it has attempts left. Everything
/// else is timed out.
#[instrument(skip(db))]
pub async fn reap_stale_batches(
    db: &DatabaseConnection,
    stale_window: Duration,
    max_retries: i32,
) -> ServerResult<ReapSummary> {
    let cutoff = Utc::now() - chrono_duration(stale_window);
    let mut summary = ReapSummary::default();

    for batch in db.stale_batches(cutoff).await? {
        if batch.status.0 == BatchStatus::Started && batch.retry_count < max_retries {
            if db.retry_batch(batch.id).await?.is_changed() {
                tracing::debug!(
                    "Retrying batch {} of tracker {}",
                    batch.batch_number,
                    batch.tracker_id
                );
                summary.retried += 1;
            }
        } else {
            let applied = db
                .transition_batch(
                    batch.id,
                    BatchEvent::CleanupStale,
                    Some(TIMEOUT_ERROR.to_string()),
                )
                .await?;

            if applied.is_changed() {
                tracing::debug!(
                    "Timed out batch {} of tracker {}",
                    batch.batch_number,
                    batch.tracker_id
                );
                summary.timed_out += 1;
            }
        }
    }

    Ok(summary)
}

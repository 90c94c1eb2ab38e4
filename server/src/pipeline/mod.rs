//! The destination side of a migration.
//!
//! Workers claim trackers, consult the source's export status, and pull
//! relation data page by page until the relation is exhausted. Progress
//! lives in the database, so any worker may resume a tracker another
//! worker abandoned.

pub mod export_status;
pub mod hooks;
pub mod persister;
mod runner;
mod worker;


use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::DatabaseConnection;

use crate::config::PipelineConfig;
use crate::database::{Applied, PipelineDatabase};
use crate::error::ServerResult;
use crate::source::SourceConnector;
use ferry::status::{EntityEvent, EntityStatus};
use hooks::{NoopHooks, PipelineHooks};
use persister::{NoopPersister, RelationPersister};

pub use runner::RunOutcome;
pub use worker::PassSummary;

/// The destination-side pipeline.
pub struct Pipeline {
    database: DatabaseConnection,
    connector: Arc<dyn SourceConnector>,
    persister: Arc<dyn RelationPersister>,
    hooks: Arc<dyn PipelineHooks>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        database: DatabaseConnection,
        connector: Arc<dyn SourceConnector>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            database,
            connector,
            persister: Arc::new(NoopPersister),
            hooks: Arc::new(NoopHooks),
            config,
        }
    }

    /// Replaces the persister.
    pub fn with_persister(mut self, persister: Arc<dyn RelationPersister>) -> Self {
        self.persister = persister;
        self
    }

    /// Replaces the hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn PipelineHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Cancels an entity and skips whatever work it has left.
    ///
    /// Workers still holding one of its trackers discard their
    /// current page.
    pub async fn cancel_entity(&self, entity_id: i64) -> ServerResult<Applied<EntityStatus>> {
        let applied = self
            .database
            .transition_entity(entity_id, EntityEvent::Cancel)
            .await?;

        if applied.status() == EntityStatus::Canceled {
            let skipped = self.database.skip_open_trackers(entity_id).await?;
            tracing::info!(
                "Canceled entity {}, skipped {} trackers",
                entity_id,
                skipped
            );
        }

        Ok(applied)
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono_duration(self.config.lease)
    }
}

pub(crate) fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::days(365))
}

//! Extension points of the pipeline.

use async_trait::async_trait;

use crate::database::entity::import_entity::ImportEntityModel;
use crate::database::entity::tracker::TrackerModel;

/// Callbacks invoked as work completes.
///
/// All methods default to doing nothing.
#[async_trait]
pub trait PipelineHooks: Send + Sync {
    /// Called after a tracker is finished.
    async fn tracker_finished(&self, _entity: &ImportEntityModel, _tracker: &TrackerModel) {}

    /// Called after every tracker of an entity is settled and the
    /// entity itself is finished or failed.
    async fn entity_finished(&self, _entity: &ImportEntityModel) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default)]
pub struct NoopHooks;

impl PipelineHooks for NoopHooks {}

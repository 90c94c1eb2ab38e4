//! Persisting relation data.

use anyhow::Result;
use async_trait::async_trait;

use crate::database::entity::import_entity::ImportEntityModel;
use crate::source::relation::RelationPage;

/// The result of persisting a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    /// ID of the group or project materialized on the destination.
    ///
    /// Set when persisting created the object an entity stands for.
    pub linked_portable: Option<i64>,
}

/// Turns fetched relation data into destination records.
///
/// A page may be delivered more than once, so persisting must be
/// idempotent.
#[async_trait]
pub trait RelationPersister: Send + Sync {
    async fn persist(
        &self,
        entity: &ImportEntityModel,
        relation: &str,
        page: &RelationPage,
    ) -> Result<PersistOutcome>;
}

/// A persister that discards everything.
#[derive(Debug, Default)]
pub struct NoopPersister;

#[async_trait]
impl RelationPersister for NoopPersister {
    async fn persist(
        &self,
        _entity: &ImportEntityModel,
        relation: &str,
        page: &RelationPage,
    ) -> Result<PersistOutcome> {
        tracing::debug!(
            "Discarding {} records of {} (page {})",
            page.records.len(),
            relation,
            page.page
        );

        Ok(PersistOutcome::default())
    }
}

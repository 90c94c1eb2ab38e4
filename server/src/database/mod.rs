pub mod entity;
pub mod export;
pub mod migration;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::query::{QueryOrder, QuerySelect};
use sea_orm::sea_query::{Expr, OnConflict, Query};
use sea_orm::{ActiveValue::Set, Condition, DatabaseConnection, UpdateMany};

use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::secret::{EncryptionKey, NewConfiguration};
use entity::batch_tracker::{self, BatchTrackerModel, Entity as BatchTracker};
use entity::configuration::{self, ConfigurationModel, Entity as Configuration};
use entity::failure::{self, Entity as Failure, FailureModel, MAX_MESSAGE_LENGTH};
use entity::import_entity::{self, Entity as ImportEntity, ImportEntityModel, SourceType};
use entity::import_job::{self, Entity as ImportJob, ImportJobModel};
use entity::tracker::{self, Entity as Tracker, TrackerModel};
use entity::Status;
use ferry::error::FerryError;
use ferry::relation::{PortableType, RelationRegistry};
use ferry::state::{StateMachine, Transition};
use ferry::status::{
    BatchEvent, BatchStatus, EntityEvent, EntityStatus, TrackerEvent, TrackerStatus,
};

/// The outcome of a guarded state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied<S> {
    /// The row moved into the contained state.
    Changed(S),

    /// The row was already in the contained, equivalent state.
    ///
    /// This is what the loser of a race observes.
    AlreadyApplied(S),

    /// The transition is valid from the row's current state, but the
    /// additional conditions of the update did not hold.
    Rejected(S),
}

/// The outcome of advancing the pagination cursor of a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageAdvance {
    /// The cursor moved forward.
    Advanced,

    /// The tracker is no longer started, or another worker already
    /// advanced past the page.
    Discarded,
}

/// A table whose rows carry a status driven by a state machine.
pub trait StatusTable: EntityTrait {
    type State: StateMachine + Into<i16> + TryFrom<i16, Error = FerryError>;

    const ID: Self::Column;
    const STATUS: Self::Column;
    const UPDATED_AT: Self::Column;

    /// The error returned when the row does not exist.
    fn not_found() -> ErrorKind;
}

/// An entity to create.
#[derive(Debug, Clone)]
pub struct NewEntity {
    pub job_id: i64,
    pub parent_id: Option<i64>,
    pub source_type: PortableType,
    pub source_full_path: String,
    pub source_xid: Option<i64>,
    pub destination_name: String,
    pub destination_namespace: String,
}

/// A group or project discovered on the source, with its descendants.
#[derive(Debug, Clone)]
pub struct DiscoveredPortable {
    pub source_type: PortableType,
    pub source_full_path: String,
    pub source_xid: Option<i64>,
    pub destination_name: String,
    pub destination_namespace: String,
    pub children: Vec<DiscoveredPortable>,
}

/// A failure to record.
#[derive(Debug, Clone)]
pub struct NewFailure {
    pub entity_id: i64,
    pub tracker_id: Option<i64>,
    pub relation: Option<String>,
    pub exception_class: String,
    pub exception_message: String,
}

#[async_trait]
pub trait PipelineDatabase: Send + Sync {
    /// Creates a migration job.
    async fn create_job(&self) -> ServerResult<ImportJobModel>;

    /// Stores the encrypted credentials of a job.
    async fn create_configuration(
        &self,
        job_id: i64,
        config: &NewConfiguration,
        key: &EncryptionKey,
    ) -> ServerResult<ConfigurationModel>;

    /// Retrieves the credentials of a job.
    async fn find_configuration(&self, job_id: i64) -> ServerResult<ConfigurationModel>;

    /// Creates an entity after validating its place in the hierarchy.
    async fn create_entity(&self, entity: NewEntity) -> ServerResult<ImportEntityModel>;

    /// Creates an entity for every discovered portable, along with
    /// one tracker per supported relation.
    ///
    /// Returns the entities in creation order, parents first.
    async fn create_entity_tree(
        &self,
        job_id: i64,
        root: DiscoveredPortable,
        registry: &dyn RelationRegistry,
    ) -> ServerResult<Vec<ImportEntityModel>>;

    /// Retrieves an entity.
    async fn find_entity(&self, entity_id: i64) -> ServerResult<ImportEntityModel>;

    /// Lists entities in a status, oldest first.
    async fn entities_with_status(
        &self,
        status: EntityStatus,
        limit: u64,
    ) -> ServerResult<Vec<ImportEntityModel>>;

    /// Links an entity to the group or project created on the destination.
    async fn link_portable(
        &self,
        entity_id: i64,
        portable_type: PortableType,
        local_id: i64,
    ) -> ServerResult<ImportEntityModel>;

    /// Applies an event to an entity.
    async fn transition_entity(
        &self,
        entity_id: i64,
        event: EntityEvent,
    ) -> ServerResult<Applied<EntityStatus>>;

    /// Creates one tracker per relation supported by an entity.
    async fn create_trackers(
        &self,
        entity: &ImportEntityModel,
        registry: &dyn RelationRegistry,
    ) -> ServerResult<Vec<TrackerModel>>;

    /// Retrieves a tracker.
    async fn find_tracker(&self, tracker_id: i64) -> ServerResult<TrackerModel>;

    /// Lists the trackers of an entity in stage order.
    async fn trackers_for_entity(&self, entity_id: i64) -> ServerResult<Vec<TrackerModel>>;

    /// Applies an event to a tracker.
    async fn transition_tracker(
        &self,
        tracker_id: i64,
        event: TrackerEvent,
    ) -> ServerResult<Applied<TrackerStatus>>;

    /// Skips every tracker of an entity that is not settled yet.
    async fn skip_open_trackers(&self, entity_id: i64) -> ServerResult<u64>;

    /// Lists trackers a worker may claim.
    ///
    /// These are created trackers of started entities, and started
    /// trackers whose lease has expired.
    async fn claimable_trackers(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> ServerResult<Vec<TrackerModel>>;

    /// Claims a tracker until `lease_until`.
    ///
    /// Returns `None` if another worker got there first.
    async fn claim_tracker(
        &self,
        tracker_id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> ServerResult<Option<TrackerModel>>;

    /// Extends the lease on a started tracker.
    async fn renew_lease(&self, tracker_id: i64, lease_until: DateTime<Utc>) -> ServerResult<bool>;

    /// Gives up the lease on a started tracker so any worker may
    /// pick it up again.
    async fn release_lease(&self, tracker_id: i64) -> ServerResult<()>;

    /// Returns whether every tracker of an earlier stage is settled.
    async fn stage_gate_open(&self, tracker: &TrackerModel) -> ServerResult<bool>;

    /// Returns whether every tracker of an entity is settled.
    async fn trackers_settled(&self, entity_id: i64) -> ServerResult<bool>;

    /// Records that `fetched_page` was persisted.
    ///
    /// `next_page` is the page reported by the source, or `None` if
    /// there are no more pages.
    async fn advance_page(
        &self,
        tracker_id: i64,
        fetched_page: i64,
        next_page: Option<i64>,
    ) -> ServerResult<PageAdvance>;

    /// Finishes a tracker once all of its batches are settled.
    ///
    /// Fails with `BatchesPending` while any batch is created, started,
    /// or timed out.
    async fn finish_tracker(&self, tracker_id: i64) -> ServerResult<Applied<TrackerStatus>>;

    /// Returns the batch of a tracker, creating it if needed.
    async fn find_or_create_batch(
        &self,
        tracker_id: i64,
        batch_number: i32,
    ) -> ServerResult<BatchTrackerModel>;

    /// Lists the batches of a tracker in order.
    async fn batches_for_tracker(&self, tracker_id: i64) -> ServerResult<Vec<BatchTrackerModel>>;

    /// Applies an event to a batch, recording an error message if given.
    async fn transition_batch(
        &self,
        batch_id: i64,
        event: BatchEvent,
        error: Option<String>,
    ) -> ServerResult<Applied<BatchStatus>>;

    /// Returns a stale batch to the queue, bumping its retry count.
    async fn retry_batch(&self, batch_id: i64) -> ServerResult<Applied<BatchStatus>>;

    /// Lists created or started batches not updated since `cutoff`.
    async fn stale_batches(&self, cutoff: DateTime<Utc>) -> ServerResult<Vec<BatchTrackerModel>>;

    /// Appends a failure record.
    async fn record_failure(&self, failure: NewFailure) -> ServerResult<FailureModel>;

    /// Lists the failures of an entity.
    async fn failures_for_entity(&self, entity_id: i64) -> ServerResult<Vec<FailureModel>>;
}

impl StatusTable for ImportEntity {
    type State = EntityStatus;

    const ID: Self::Column = import_entity::Column::Id;
    const STATUS: Self::Column = import_entity::Column::Status;
    const UPDATED_AT: Self::Column = import_entity::Column::UpdatedAt;

    fn not_found() -> ErrorKind {
        ErrorKind::NoSuchEntity
    }
}

impl StatusTable for Tracker {
    type State = TrackerStatus;

    const ID: Self::Column = tracker::Column::Id;
    const STATUS: Self::Column = tracker::Column::Status;
    const UPDATED_AT: Self::Column = tracker::Column::UpdatedAt;

    fn not_found() -> ErrorKind {
        ErrorKind::NoSuchTracker
    }
}

impl StatusTable for BatchTracker {
    type State = BatchStatus;

    const ID: Self::Column = batch_tracker::Column::Id;
    const STATUS: Self::Column = batch_tracker::Column::Status;
    const UPDATED_AT: Self::Column = batch_tracker::Column::UpdatedAt;

    fn not_found() -> ErrorKind {
        ErrorKind::BatchNotFound
    }
}

impl<S: Copy> Applied<S> {
    /// Returns the status of the row after the call.
    pub fn status(&self) -> S {
        match self {
            Self::Changed(s) | Self::AlreadyApplied(s) | Self::Rejected(s) => *s,
        }
    }

    /// Returns whether this call moved the row.
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// Applies an event to a row in a single conditional update.
///
/// The update only matches if the row is in one of the states the
/// event moves out of, so concurrent callers cannot both succeed.
/// `update` may carry additional assignments and conditions.
///
/// If nothing was updated, the row is re-read: a state in which the
/// event is a no-op yields `AlreadyApplied`, a state from which the
/// event is invalid yields an `InvalidTransition` error.
pub(crate) async fn apply_transition<T: StatusTable>(
    db: &DatabaseConnection,
    id: i64,
    event: <T::State as StateMachine>::Event,
    update: UpdateMany<T>,
) -> ServerResult<Applied<T::State>> {
    if let Some(guard) = T::State::guard(event) {
        let result = update
            .col_expr(T::STATUS, Expr::value(Status(guard.target)))
            .col_expr(T::UPDATED_AT, Expr::value(Utc::now()))
            .filter(T::ID.eq(id))
            .filter(T::STATUS.is_in(guard.from.iter().copied().map(Status)))
            .exec(db)
            .await
            .map_err(ServerError::database_error)?;

        if result.rows_affected > 0 {
            return Ok(Applied::Changed(guard.target));
        }
    }

    let current = find_status::<T>(db, id).await?;

    match current.transition(event)? {
        Transition::Unchanged => Ok(Applied::AlreadyApplied(current)),
        Transition::Changed(_) => Ok(Applied::Rejected(current)),
    }
}

/// Reads the current status of a row.
pub(crate) async fn find_status<T: StatusTable>(
    db: &DatabaseConnection,
    id: i64,
) -> ServerResult<T::State> {
    let code: Option<i16> = T::find()
        .select_only()
        .column(T::STATUS)
        .filter(T::ID.eq(id))
        .into_tuple()
        .one(db)
        .await
        .map_err(ServerError::database_error)?;

    let code = code.ok_or_else(|| ServerError::from(T::not_found()))?;

    Ok(T::State::try_from(code)?)
}

fn statuses<S: StateMachine>(filter: impl Fn(S) -> bool) -> Vec<Status<S>> {
    S::STATES
        .iter()
        .copied()
        .filter(|s| filter(*s))
        .map(Status)
        .collect()
}

/// Connects to a fresh in-memory database with all migrations applied.
#[cfg(test)]
pub(crate) async fn test_database() -> DatabaseConnection {
    use migration::{Migrator, MigratorTrait};
    use sea_orm::{ConnectOptions, Database};

    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.max_connections(1).sqlx_logging(false);

    let db = Database::connect(options).await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    db
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[async_trait]
impl PipelineDatabase for DatabaseConnection {
    async fn create_job(&self) -> ServerResult<ImportJobModel> {
        let job = import_job::ActiveModel {
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        job.insert(self).await.map_err(ServerError::database_error)
    }

    async fn create_configuration(
        &self,
        job_id: i64,
        config: &NewConfiguration,
        key: &EncryptionKey,
    ) -> ServerResult<ConfigurationModel> {
        config.validate()?;

        ImportJob::find_by_id(job_id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ServerError::validation_error("job does not exist"))?;

        let url = key.encrypt(&config.url)?;
        let access_token = key.encrypt(&config.access_token)?;
        let now = Utc::now();

        let model = configuration::ActiveModel {
            job_id: Set(job_id),
            encrypted_url: Set(url.ciphertext),
            encrypted_url_iv: Set(url.iv),
            encrypted_access_token: Set(access_token.ciphertext),
            encrypted_access_token_iv: Set(access_token.iv),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        model.insert(self).await.map_err(ServerError::database_error)
    }

    async fn find_configuration(&self, job_id: i64) -> ServerResult<ConfigurationModel> {
        Configuration::find()
            .filter(configuration::Column::JobId.eq(job_id))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ErrorKind::NoSuchConfiguration.into())
    }

    async fn create_entity(&self, entity: NewEntity) -> ServerResult<ImportEntityModel> {
        if entity.source_full_path.trim().is_empty() {
            return Err(ServerError::validation_error("source_full_path can't be blank"));
        }

        if entity.destination_name.trim().is_empty() {
            return Err(ServerError::validation_error("destination_name can't be blank"));
        }

        if let Some(parent_id) = entity.parent_id {
            let parent = ImportEntity::find_by_id(parent_id)
                .one(self)
                .await
                .map_err(ServerError::database_error)?
                .ok_or_else(|| ServerError::validation_error("parent entity does not exist"))?;

            if parent.source_type != SourceType::Group {
                return Err(ServerError::validation_error(
                    "parent entity must be a group",
                ));
            }

            if parent.job_id != entity.job_id {
                return Err(ServerError::validation_error(
                    "parent entity belongs to another job",
                ));
            }
        }

        let now = Utc::now();
        let model = import_entity::ActiveModel {
            job_id: Set(entity.job_id),
            parent_id: Set(entity.parent_id),
            source_type: Set(entity.source_type.into()),
            source_full_path: Set(entity.source_full_path),
            source_xid: Set(entity.source_xid),
            destination_name: Set(entity.destination_name),
            destination_namespace: Set(entity.destination_namespace),
            linked_group_id: Set(None),
            linked_project_id: Set(None),
            status: Set(Status(EntityStatus::Created)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        model.insert(self).await.map_err(ServerError::database_error)
    }

    async fn create_entity_tree(
        &self,
        job_id: i64,
        root: DiscoveredPortable,
        registry: &dyn RelationRegistry,
    ) -> ServerResult<Vec<ImportEntityModel>> {
        let mut created = Vec::new();
        let mut queue = vec![(None, root)];

        while let Some((parent_id, discovered)) = queue.pop() {
            let entity = self
                .create_entity(NewEntity {
                    job_id,
                    parent_id,
                    source_type: discovered.source_type,
                    source_full_path: discovered.source_full_path,
                    source_xid: discovered.source_xid,
                    destination_name: discovered.destination_name,
                    destination_namespace: discovered.destination_namespace,
                })
                .await?;

            self.create_trackers(&entity, registry).await?;

            // Reversed so that siblings are created in discovery order
            for child in discovered.children.into_iter().rev() {
                queue.push((Some(entity.id), child));
            }

            created.push(entity);
        }

        Ok(created)
    }

    async fn find_entity(&self, entity_id: i64) -> ServerResult<ImportEntityModel> {
        ImportEntity::find_by_id(entity_id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ErrorKind::NoSuchEntity.into())
    }

    async fn entities_with_status(
        &self,
        status: EntityStatus,
        limit: u64,
    ) -> ServerResult<Vec<ImportEntityModel>> {
        ImportEntity::find()
            .filter(import_entity::Column::Status.eq(Status(status)))
            .order_by_asc(import_entity::Column::Id)
            .limit(limit)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn link_portable(
        &self,
        entity_id: i64,
        portable_type: PortableType,
        local_id: i64,
    ) -> ServerResult<ImportEntityModel> {
        let entity = self.find_entity(entity_id).await?;

        if entity.portable_type() != portable_type {
            return Err(ServerError::validation_error(format!(
                "a {} entity can't be linked to a {}",
                entity.portable_type(),
                portable_type
            )));
        }

        let (column, other) = match portable_type {
            PortableType::Group => (
                import_entity::Column::LinkedGroupId,
                import_entity::Column::LinkedProjectId,
            ),
            PortableType::Project => (
                import_entity::Column::LinkedProjectId,
                import_entity::Column::LinkedGroupId,
            ),
        };

        let result = ImportEntity::update_many()
            .col_expr(column, Expr::value(local_id))
            .col_expr(import_entity::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(import_entity::Column::Id.eq(entity_id))
            .filter(other.is_null())
            .filter(column.is_null().or(column.eq(local_id)))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        if result.rows_affected == 0 {
            return Err(ServerError::validation_error(
                "entity is already linked to another object",
            ));
        }

        self.find_entity(entity_id).await
    }

    async fn transition_entity(
        &self,
        entity_id: i64,
        event: EntityEvent,
    ) -> ServerResult<Applied<EntityStatus>> {
        apply_transition(self, entity_id, event, ImportEntity::update_many()).await
    }

    async fn create_trackers(
        &self,
        entity: &ImportEntityModel,
        registry: &dyn RelationRegistry,
    ) -> ServerResult<Vec<TrackerModel>> {
        let now = Utc::now();
        let relations = registry.portable_relations(entity.portable_type());

        if relations.is_empty() {
            return Ok(Vec::new());
        }

        let models = relations.iter().map(|def| tracker::ActiveModel {
            entity_id: Set(entity.id),
            relation: Set(def.name.to_string()),
            stage: Set(def.stage),
            status: Set(Status(TrackerStatus::Created)),
            next_page: Set(None),
            last_page: Set(None),
            started_at: Set(None),
            lease_expires_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        });

        Tracker::insert_many(models)
            .on_conflict(
                OnConflict::columns([tracker::Column::EntityId, tracker::Column::Relation])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self)
            .await
            .map_err(ServerError::database_error)?;

        self.trackers_for_entity(entity.id).await
    }

    async fn find_tracker(&self, tracker_id: i64) -> ServerResult<TrackerModel> {
        Tracker::find_by_id(tracker_id)
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ErrorKind::NoSuchTracker.into())
    }

    async fn trackers_for_entity(&self, entity_id: i64) -> ServerResult<Vec<TrackerModel>> {
        Tracker::find()
            .filter(tracker::Column::EntityId.eq(entity_id))
            .order_by_asc(tracker::Column::Stage)
            .order_by_asc(tracker::Column::Id)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn transition_tracker(
        &self,
        tracker_id: i64,
        event: TrackerEvent,
    ) -> ServerResult<Applied<TrackerStatus>> {
        let mut update = Tracker::update_many();

        if matches!(event, TrackerEvent::FailOp | TrackerEvent::Skip) {
            update = update.col_expr(
                tracker::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            );
        }

        apply_transition(self, tracker_id, event, update).await
    }

    async fn skip_open_trackers(&self, entity_id: i64) -> ServerResult<u64> {
        let result = Tracker::update_many()
            .col_expr(tracker::Column::Status, Expr::value(Status(TrackerStatus::Skipped)))
            .col_expr(
                tracker::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(tracker::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(tracker::Column::EntityId.eq(entity_id))
            .filter(tracker::Column::Status.is_in(statuses(|s: TrackerStatus| !s.is_terminal())))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(result.rows_affected)
    }

    async fn claimable_trackers(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> ServerResult<Vec<TrackerModel>> {
        let started_entities = Query::select()
            .column(import_entity::Column::Id)
            .from(ImportEntity)
            .and_where(import_entity::Column::Status.eq(Status(EntityStatus::Started)))
            .to_owned();

        Tracker::find()
            .filter(
                Condition::any()
                    .add(
                        Condition::all()
                            .add(tracker::Column::Status.eq(Status(TrackerStatus::Created)))
                            .add(tracker::Column::EntityId.in_subquery(started_entities)),
                    )
                    .add(
                        Condition::all()
                            .add(tracker::Column::Status.eq(Status(TrackerStatus::Started)))
                            .add(
                                Condition::any()
                                    .add(tracker::Column::LeaseExpiresAt.is_null())
                                    .add(tracker::Column::LeaseExpiresAt.lt(now)),
                            ),
                    ),
            )
            .order_by_asc(tracker::Column::EntityId)
            .order_by_asc(tracker::Column::Stage)
            .order_by_asc(tracker::Column::Id)
            .limit(limit)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn claim_tracker(
        &self,
        tracker_id: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> ServerResult<Option<TrackerModel>> {
        let started_entities = Query::select()
            .column(import_entity::Column::Id)
            .from(ImportEntity)
            .and_where(import_entity::Column::Status.eq(Status(EntityStatus::Started)))
            .to_owned();

        let update = Tracker::update_many()
            .col_expr(tracker::Column::StartedAt, Expr::value(now))
            .col_expr(tracker::Column::LeaseExpiresAt, Expr::value(lease_until))
            .filter(tracker::Column::EntityId.in_subquery(started_entities));

        match apply_transition(self, tracker_id, TrackerEvent::Start, update).await {
            Ok(Applied::Changed(_)) => return Ok(Some(self.find_tracker(tracker_id).await?)),
            Ok(_) => return Ok(None),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::FerryError(FerryError::InvalidTransition { .. })
                ) =>
            {
                // Already started, possibly abandoned by another worker
            }
            Err(e) => return Err(e),
        }

        let result = Tracker::update_many()
            .col_expr(tracker::Column::LeaseExpiresAt, Expr::value(lease_until))
            .col_expr(tracker::Column::UpdatedAt, Expr::value(now))
            .filter(tracker::Column::Id.eq(tracker_id))
            .filter(tracker::Column::Status.eq(Status(TrackerStatus::Started)))
            .filter(
                tracker::Column::LeaseExpiresAt
                    .is_null()
                    .or(tracker::Column::LeaseExpiresAt.lt(now)),
            )
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        if result.rows_affected == 0 {
            return Ok(None);
        }

        tracing::info!("Reclaimed abandoned tracker {}", tracker_id);

        Ok(Some(self.find_tracker(tracker_id).await?))
    }

    async fn renew_lease(&self, tracker_id: i64, lease_until: DateTime<Utc>) -> ServerResult<bool> {
        let result = Tracker::update_many()
            .col_expr(tracker::Column::LeaseExpiresAt, Expr::value(lease_until))
            .filter(tracker::Column::Id.eq(tracker_id))
            .filter(tracker::Column::Status.eq(Status(TrackerStatus::Started)))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(result.rows_affected > 0)
    }

    async fn release_lease(&self, tracker_id: i64) -> ServerResult<()> {
        Tracker::update_many()
            .col_expr(
                tracker::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(tracker::Column::Id.eq(tracker_id))
            .filter(tracker::Column::Status.eq(Status(TrackerStatus::Started)))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn stage_gate_open(&self, tracker: &TrackerModel) -> ServerResult<bool> {
        let blocking = Tracker::find()
            .filter(tracker::Column::EntityId.eq(tracker.entity_id))
            .filter(tracker::Column::Stage.lt(tracker.stage))
            .filter(tracker::Column::Status.is_in(statuses(|s: TrackerStatus| !s.is_terminal())))
            .count(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(blocking == 0)
    }

    async fn trackers_settled(&self, entity_id: i64) -> ServerResult<bool> {
        let open = Tracker::find()
            .filter(tracker::Column::EntityId.eq(entity_id))
            .filter(tracker::Column::Status.is_in(statuses(|s: TrackerStatus| !s.is_terminal())))
            .count(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(open == 0)
    }

    async fn advance_page(
        &self,
        tracker_id: i64,
        fetched_page: i64,
        next_page: Option<i64>,
    ) -> ServerResult<PageAdvance> {
        if let Some(next_page) = next_page {
            if next_page <= fetched_page {
                return Err(ErrorKind::RequestError(anyhow::anyhow!(
                    "Source returned next page {} after page {}",
                    next_page,
                    fetched_page
                ))
                .into());
            }
        }

        let result = Tracker::update_many()
            .col_expr(tracker::Column::LastPage, Expr::value(Some(fetched_page)))
            .col_expr(tracker::Column::NextPage, Expr::value(next_page))
            .col_expr(tracker::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(tracker::Column::Id.eq(tracker_id))
            .filter(tracker::Column::Status.eq(Status(TrackerStatus::Started)))
            .filter(
                tracker::Column::LastPage
                    .is_null()
                    .or(tracker::Column::LastPage.lt(fetched_page)),
            )
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        if result.rows_affected > 0 {
            Ok(PageAdvance::Advanced)
        } else {
            Ok(PageAdvance::Discarded)
        }
    }

    async fn finish_tracker(&self, tracker_id: i64) -> ServerResult<Applied<TrackerStatus>> {
        let pending = statuses(|s: BatchStatus| !s.is_terminal());

        let pending_batches = Query::select()
            .column(batch_tracker::Column::TrackerId)
            .from(BatchTracker)
            .and_where(batch_tracker::Column::TrackerId.eq(tracker_id))
            .and_where(batch_tracker::Column::Status.is_in(pending.clone()))
            .to_owned();

        let update = Tracker::update_many()
            .col_expr(
                tracker::Column::LeaseExpiresAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(tracker::Column::Id.not_in_subquery(pending_batches));

        let applied = apply_transition(self, tracker_id, TrackerEvent::Finish, update).await?;

        if let Applied::Rejected(_) = applied {
            let count = BatchTracker::find()
                .filter(batch_tracker::Column::TrackerId.eq(tracker_id))
                .filter(batch_tracker::Column::Status.is_in(pending))
                .count(self)
                .await
                .map_err(ServerError::database_error)?;

            return Err(ErrorKind::BatchesPending(count).into());
        }

        Ok(applied)
    }

    async fn find_or_create_batch(
        &self,
        tracker_id: i64,
        batch_number: i32,
    ) -> ServerResult<BatchTrackerModel> {
        let now = Utc::now();
        let model = batch_tracker::ActiveModel {
            tracker_id: Set(tracker_id),
            batch_number: Set(batch_number),
            status: Set(Status(BatchStatus::Created)),
            retry_count: Set(0),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        BatchTracker::insert(model)
            .on_conflict(
                OnConflict::columns([
                    batch_tracker::Column::TrackerId,
                    batch_tracker::Column::BatchNumber,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(self)
            .await
            .map_err(ServerError::database_error)?;

        BatchTracker::find()
            .filter(batch_tracker::Column::TrackerId.eq(tracker_id))
            .filter(batch_tracker::Column::BatchNumber.eq(batch_number))
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ErrorKind::BatchNotFound.into())
    }

    async fn batches_for_tracker(&self, tracker_id: i64) -> ServerResult<Vec<BatchTrackerModel>> {
        BatchTracker::find()
            .filter(batch_tracker::Column::TrackerId.eq(tracker_id))
            .order_by_asc(batch_tracker::Column::BatchNumber)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn transition_batch(
        &self,
        batch_id: i64,
        event: BatchEvent,
        error: Option<String>,
    ) -> ServerResult<Applied<BatchStatus>> {
        let mut update = BatchTracker::update_many();

        if let Some(error) = error {
            update = update.col_expr(batch_tracker::Column::Error, Expr::value(Some(error)));
        }

        apply_transition(self, batch_id, event, update).await
    }

    async fn retry_batch(&self, batch_id: i64) -> ServerResult<Applied<BatchStatus>> {
        let update = BatchTracker::update_many().col_expr(
            batch_tracker::Column::RetryCount,
            Expr::col(batch_tracker::Column::RetryCount).add(1),
        );

        apply_transition(self, batch_id, BatchEvent::Retry, update).await
    }

    async fn stale_batches(&self, cutoff: DateTime<Utc>) -> ServerResult<Vec<BatchTrackerModel>> {
        BatchTracker::find()
            .filter(batch_tracker::Column::Status.is_in([
                Status(BatchStatus::Created),
                Status(BatchStatus::Started),
            ]))
            .filter(batch_tracker::Column::UpdatedAt.lt(cutoff))
            .order_by_asc(batch_tracker::Column::Id)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn record_failure(&self, failure: NewFailure) -> ServerResult<FailureModel> {
        let model = failure::ActiveModel {
            entity_id: Set(failure.entity_id),
            tracker_id: Set(failure.tracker_id),
            relation: Set(failure.relation),
            exception_class: Set(truncate(&failure.exception_class, MAX_MESSAGE_LENGTH)),
            exception_message: Set(truncate(&failure.exception_message, MAX_MESSAGE_LENGTH)),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        model.insert(self).await.map_err(ServerError::database_error)
    }

    async fn failures_for_entity(&self, entity_id: i64) -> ServerResult<Vec<FailureModel>> {
        Failure::find()
            .filter(failure::Column::EntityId.eq(entity_id))
            .order_by_asc(failure::Column::Id)
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }
}

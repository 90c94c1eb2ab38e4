use std::sync::Mutex;

use chrono::Duration as ChronoDuration;
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use tokio::io::AsyncReadExt;

use super::*;
use crate::database::entity::export_batch::{self, Entity as ExportBatch};
use crate::database::test_database;
use crate::storage::{LocalBackend, LocalStorageConfig};
use ferry::relation::{DefaultRelationRegistry, PortableType};

#[derive(Default)]
struct RecordingCache {
    invalidated: Mutex<Vec<Portable>>,
}

#[async_trait]
impl UserContributionsCache for RecordingCache {
    async fn invalidate(&self, portable: Portable) -> ServerResult<()> {
        self.invalidated.lock().unwrap().push(portable);
        Ok(())
    }
}

async fn service() -> (ExportService, Arc<RecordingCache>) {
    let database = test_database().await;
    let path = std::env::temp_dir().join(format!("ferry-test-{}", Uuid::new_v4()));
    let storage = LocalBackend::new(LocalStorageConfig { path }).await.unwrap();
    let storage: Arc<Box<dyn StorageBackend>> = Arc::new(Box::new(storage));
    let cache = Arc::new(RecordingCache::default());

    let service = ExportService::new(
        database,
        storage,
        Arc::new(DefaultRelationRegistry),
        cache.clone(),
        2,
    );

    (service, cache)
}

fn download(relation: &str, batch_number: Option<i32>) -> DownloadQuery {
    DownloadQuery {
        relation: relation.parse().unwrap(),
        batched: batch_number.is_some(),
        batch_number,
    }
}

async fn read(mut download: ExportDownload) -> String {
    let mut s = String::new();
    download.stream.read_to_string(&mut s).await.unwrap();
    s
}

#[test]
fn test_portable() {
    assert_eq!(Some(Portable::Group(1)), Portable::from_ids(Some(1), None));
    assert_eq!(Some(Portable::Project(2)), Portable::from_ids(None, Some(2)));
    assert_eq!(None, Portable::from_ids(Some(1), Some(2)));
    assert_eq!(None, Portable::from_ids(None, None));

    assert_eq!((None, Some(2)), Portable::Project(2).ids());
    assert_eq!("project 2", Portable::Project(2).to_string());
}

#[test]
fn test_batch_sizes() {
    assert_eq!(Vec::<i64>::new(), batch_sizes(0, 1000));
    assert_eq!(vec![1000, 1000, 1], batch_sizes(2001, 1000));
    assert_eq!(vec![1000], batch_sizes(1000, 1000));
}

#[tokio::test]
async fn test_start_validates_relation() {
    let (service, _) = service().await;

    let e = service
        .start(Portable::Project(1), "not_a_relation", None)
        .await
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::ValidationError(_)));

    // Group-only relation on a project
    service
        .start(Portable::Project(1), "epics", None)
        .await
        .unwrap_err();

    let export = service
        .start(Portable::Group(1), "epics", Some(7))
        .await
        .unwrap();
    assert_eq!(Some(1), export.group_id);
    assert_eq!(None, export.project_id);
    assert_eq!(Some(7), export.user_id);
    assert_eq!(ExportStatusCode::Started, export.status.0);
}

#[tokio::test]
async fn test_finish_invalidates_user_contributions() {
    let (service, cache) = service().await;
    let portable = Portable::Project(3);

    let labels = service.start(portable, "labels", None).await.unwrap();
    let issues = service.start(portable, "issues", None).await.unwrap();

    service.finish(&labels).await.unwrap();
    assert!(cache.invalidated.lock().unwrap().is_empty());

    let applied = service.finish(&issues).await.unwrap();
    assert_eq!(Applied::Changed(ExportStatusCode::Finished), applied);
    assert_eq!(vec![portable], *cache.invalidated.lock().unwrap());

    // Already finished
    let applied = service.finish(&issues).await.unwrap();
    assert_eq!(Applied::AlreadyApplied(ExportStatusCode::Finished), applied);
    assert_eq!(1, cache.invalidated.lock().unwrap().len());
}

#[tokio::test]
async fn test_restart() {
    let (service, _) = service().await;
    let portable = Portable::Project(3);

    let export = service.start(portable, "labels", None).await.unwrap();
    service
        .attach_upload(&export, None, &mut &b"{\"title\":\"bug\"}\n"[..])
        .await
        .unwrap();
    service.fail_op(&export, "out of disk").await.unwrap();

    let statuses = service.statuses(portable, Some("labels")).await.unwrap();
    assert_eq!(ExportStatusCode::Failed, statuses[0].status);
    assert_eq!(Some("out of disk"), statuses[0].error.as_deref());

    let restarted = service.start(portable, "labels", None).await.unwrap();
    assert_eq!(export.id, restarted.id);
    assert_eq!(ExportStatusCode::Started, restarted.status.0);
    assert_eq!(None, restarted.error);

    // The previous artifact is gone
    let e = service
        .open_download(portable, &download("labels", None))
        .await
        .err()
        .unwrap();
    assert!(matches!(e.kind(), ErrorKind::NotFound));

    // Removing again is fine
    service.remove_existing_upload(export.id).await.unwrap();
}

#[tokio::test]
async fn test_download() {
    let (service, _) = service().await;
    let portable = Portable::Project(3);

    let e = service
        .open_download(portable, &download("labels", None))
        .await
        .err()
        .unwrap();
    assert!(matches!(e.kind(), ErrorKind::NoSuchExport));

    let e = service
        .open_download(portable, &download("nope", None))
        .await
        .err()
        .unwrap();
    assert!(matches!(e.kind(), ErrorKind::ValidationError(_)));

    let export = service.start(portable, "labels", None).await.unwrap();
    service
        .attach_upload(&export, None, &mut &b"{\"title\":\"bug\"}\n"[..])
        .await
        .unwrap();

    let d = service
        .open_download(portable, &download("labels", None))
        .await
        .unwrap();
    assert_eq!("labels.ndjson.gz", d.filename);
    assert_eq!(None, d.next_page);
    assert_eq!("{\"title\":\"bug\"}\n", read(d).await);

    // Other portables don't see it
    service
        .open_download(Portable::Group(3), &download("labels", None))
        .await
        .err()
        .unwrap();
}

#[tokio::test]
async fn test_batched_export() {
    let (service, _) = service().await;
    let portable = Portable::Project(3);

    let export = service.start(portable, "issues", None).await.unwrap();
    let batches = service.plan_batches(&export, 5).await.unwrap();
    assert_eq!(
        vec![2, 2, 1],
        batches.iter().map(|b| b.objects_count).collect::<Vec<_>>()
    );
    assert_eq!(
        vec![1, 2, 3],
        batches.iter().map(|b| b.batch_number).collect::<Vec<_>>()
    );

    for batch in &batches[..2] {
        service
            .attach_upload(&export, Some(batch), &mut &b"{\"iid\":1}\n"[..])
            .await
            .unwrap();
    }

    let export = service
        .database
        .find_export(portable, "issues")
        .await
        .unwrap()
        .unwrap();
    assert!(export.batched);
    assert_eq!(3, export.batches_count);

    let e = service
        .open_download(portable, &download("issues", None))
        .await
        .err()
        .unwrap();
    assert!(matches!(e.kind(), ErrorKind::ExportIsBatched));
    assert_eq!("Export is batched", e.to_string());

    let e = service
        .open_download(portable, &download("issues", Some(0)))
        .await
        .err()
        .unwrap();
    assert_eq!("Batch not found", e.to_string());

    let e = service
        .open_download(portable, &download("issues", Some(3)))
        .await
        .err()
        .unwrap();
    assert_eq!("Batch file not found", e.to_string());

    let d = service
        .open_download(portable, &download("issues", Some(1)))
        .await
        .unwrap();
    assert_eq!(Some(2), d.next_page);

    // The export settles once no batch is running
    service.finish_batch(&export, &batches[0]).await.unwrap();
    service.finish_batch(&export, &batches[1]).await.unwrap();
    let statuses = service.statuses(portable, None).await.unwrap();
    assert_eq!(ExportStatusCode::Started, statuses[0].status);
    assert_eq!(3, statuses[0].batches.len());

    service
        .fail_batch(&export, &batches[2], "boom")
        .await
        .unwrap();
    let statuses = service.statuses(portable, None).await.unwrap();
    assert_eq!(ExportStatusCode::Failed, statuses[0].status);
    assert_eq!(Some("boom"), statuses[0].batches[2].error.as_deref());
}

#[tokio::test]
async fn test_unbatchable_relation() {
    let (service, _) = service().await;

    let export = service
        .start(Portable::Project(3), "members", None)
        .await
        .unwrap();
    let e = service.plan_batches(&export, 5).await.unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::ValidationError(_)));

    // Nothing was recorded
    let export = service
        .database
        .find_export_by_id(export.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!export.batched);
    assert!(service.database.export_batches(export.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve() {
    let (service, _) = service().await;

    service
        .register_route(Portable::Project(3), "a/b")
        .await
        .unwrap();
    service
        .register_route(Portable::Group(1), "/a/")
        .await
        .unwrap();

    assert_eq!(
        Portable::Project(3),
        service.resolve(PortableType::Project, "a/b").await.unwrap()
    );
    assert_eq!(
        Portable::Group(1),
        service.resolve(PortableType::Group, "a").await.unwrap()
    );
    assert_eq!(
        Portable::Project(12),
        service.resolve(PortableType::Project, "12").await.unwrap()
    );

    // A path names one type only
    let e = service
        .resolve(PortableType::Group, "a/b")
        .await
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::NoSuchPortable));

    let e = service
        .resolve(PortableType::Project, "a/c")
        .await
        .unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::NoSuchPortable));

    // Moving a project updates its route
    service
        .register_route(Portable::Project(4), "a/b")
        .await
        .unwrap();
    assert_eq!(
        Portable::Project(4),
        service.resolve(PortableType::Project, "a/b").await.unwrap()
    );

    service
        .register_route(Portable::Project(5), "")
        .await
        .unwrap_err();
}

#[tokio::test]
async fn test_reap_stale_batches() {
    let (service, _) = service().await;
    let portable = Portable::Project(3);
    let window = ChronoDuration::hours(1);

    let export = service.start(portable, "issues", None).await.unwrap();
    let batches = service.plan_batches(&export, 4).await.unwrap();
    service.finish_batch(&export, &batches[0]).await.unwrap();

    assert_eq!(0, service.reap_stale_batches(window).await.unwrap());

    ExportBatch::update_many()
        .col_expr(
            export_batch::Column::UpdatedAt,
            Expr::value(Utc::now() - ChronoDuration::hours(2)),
        )
        .filter(export_batch::Column::Id.eq(batches[1].id))
        .exec(&service.database)
        .await
        .unwrap();

    let batch = service
        .database
        .find_export_batch(export.id, 2)
        .await
        .unwrap()
        .unwrap();
    assert!(!batch.is_started_and_not_timed_out(Utc::now(), window));

    assert_eq!(1, service.reap_stale_batches(window).await.unwrap());
    assert_eq!(0, service.reap_stale_batches(window).await.unwrap());

    let statuses = service.statuses(portable, Some("issues")).await.unwrap();
    assert_eq!(ExportStatusCode::Failed, statuses[0].status);
    assert_eq!(ExportStatusCode::Failed, statuses[0].batches[1].status);
}

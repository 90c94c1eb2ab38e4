//! The source's view of a relation export.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::RetryConfig;
use crate::source::{with_backoff, SourceClient, SourceError, SourceRequest};
use ferry::api::v1::export_relations::{
    export_relations_segments, BatchExportStatus, RelationExportStatus, StatusResponse,
};
use ferry::relation::PortableType;
use ferry::status::ExportStatusCode;

/// Error reported when the source has no status for the relation.
pub const EMPTY_STATUS_ERROR: &str = "Empty relation export status";

/// The status of one relation export on the source.
///
/// The source is polled at most once per instance, on first access.
/// Errors never escape: if the status cannot be obtained, a failed
/// status carrying the error message is synthesized instead.
pub struct ExportStatus {
    client: Arc<dyn SourceClient>,
    retry: RetryConfig,
    portable_type: PortableType,
    source_id: String,
    relation: String,
    status: OnceCell<Polled>,
}

/// A polled status.
struct Polled {
    status: RelationExportStatus,

    /// Whether the status was synthesized.
    synthesized: bool,
}

impl ExportStatus {
    pub fn new(
        client: Arc<dyn SourceClient>,
        retry: RetryConfig,
        portable_type: PortableType,
        source_id: impl Into<String>,
        relation: impl Into<String>,
    ) -> Self {
        Self {
            client,
            retry,
            portable_type,
            source_id: source_id.into(),
            relation: relation.into(),
            status: OnceCell::new(),
        }
    }

    /// Returns whether the source is still exporting the relation.
    pub async fn started(&self) -> bool {
        self.polled().await.status.status == ExportStatusCode::Started
    }

    /// Returns whether the export is complete.
    pub async fn finished(&self) -> bool {
        self.polled().await.status.status == ExportStatusCode::Finished
    }

    /// Returns whether the export failed, or its status is unavailable.
    pub async fn failed(&self) -> bool {
        self.polled().await.status.status == ExportStatusCode::Failed
    }

    /// Returns whether the status could not be obtained from the source.
    ///
    /// An unavailable status is also failed, but the source never said so.
    pub async fn unavailable(&self) -> bool {
        self.polled().await.synthesized
    }

    /// Returns the error message, if any.
    pub async fn error(&self) -> Option<String> {
        self.polled().await.status.error.clone()
    }

    /// Returns whether the relation is exported in batches.
    pub async fn batched(&self) -> bool {
        self.polled().await.status.batched
    }

    /// Returns the number of batches.
    pub async fn batches_count(&self) -> i32 {
        self.polled().await.status.batches_count
    }

    /// Returns the total number of exported objects.
    pub async fn total_objects_count(&self) -> i64 {
        self.polled().await.status.total_objects_count
    }

    /// Returns the status of a batch.
    pub async fn batch(&self, batch_number: i32) -> Option<BatchExportStatus> {
        self.polled()
            .await
            .status
            .batches
            .iter()
            .find(|b| b.batch_number == batch_number)
            .cloned()
    }

    async fn polled(&self) -> &Polled {
        self.status.get_or_init(|| self.poll()).await
    }

    async fn poll(&self) -> Polled {
        match self.fetch().await {
            Ok(Some(status)) => Polled {
                status,
                synthesized: false,
            },
            Ok(None) => self.synthesize(EMPTY_STATUS_ERROR.to_string()),
            Err(e) => {
                tracing::warn!(
                    "Failed to fetch export status of {} of {}: {}",
                    self.relation,
                    self.source_id,
                    e
                );
                self.synthesize(e.to_string())
            }
        }
    }

    async fn fetch(&self) -> Result<Option<RelationExportStatus>, SourceError> {
        let request = SourceRequest::new(export_relations_segments(
            self.portable_type,
            &self.source_id,
        ))
        .segment("status")
        .param("relation", self.relation.as_str());

        let client = self.client.as_ref();
        let request = &request;
        let response = with_backoff(&self.retry, || async move {
            client.get(request).await?.error_for_status()
        })
        .await?;

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let statuses = serde_json::from_slice::<StatusResponse>(&response.body)
            .map_err(|e| SourceError::Malformed(e.to_string()))?
            .into_vec();

        Ok(statuses.into_iter().find(|s| s.relation == self.relation))
    }

    fn synthesize(&self, error: String) -> Polled {
        Polled {
            status: RelationExportStatus {
                relation: self.relation.clone(),
                status: ExportStatusCode::Failed,
                error: Some(error),
                batched: false,
                batches_count: 0,
                total_objects_count: 0,
                batches: Vec::new(),
                updated_at: None,
            },
            synthesized: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::source::fake::{FakeSource, Reply};

    const STATUS: &str = "/api/v4/projects/a/b/export_relations/status?relation=issues";

    fn export_status(source: &Arc<FakeSource>) -> ExportStatus {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        };

        ExportStatus::new(source.clone(), retry, PortableType::Project, "a/b", "issues")
    }

    #[tokio::test]
    async fn test_started() {
        let source = FakeSource::new();
        source.reply(
            STATUS,
            Reply::json(
                200,
                r#"[{"relation": "labels", "status": 1}, {"relation": "issues", "status": 0, "error": null}]"#,
            ),
        );

        let status = export_status(&source);
        assert!(status.started().await);
        assert!(!status.failed().await);
        assert!(!status.unavailable().await);
        assert_eq!(None, status.error().await);

        // Memoized
        assert_eq!(1, source.count(STATUS));
    }

    #[tokio::test]
    async fn test_single_object_and_batches() {
        let source = FakeSource::new();
        source.reply(
            STATUS,
            Reply::json(
                200,
                r#"{"relation": "issues", "status": 1, "batched": true, "batches_count": 2,
                    "total_objects_count": 1500,
                    "batches": [{"batch_number": 1, "status": 1, "objects_count": 1000},
                                {"batch_number": 2, "status": 1, "objects_count": 500}]}"#,
            ),
        );

        let status = export_status(&source);
        assert!(status.finished().await);
        assert!(status.batched().await);
        assert_eq!(2, status.batches_count().await);
        assert_eq!(1500, status.total_objects_count().await);
        assert_eq!(500, status.batch(2).await.unwrap().objects_count);
        assert!(status.batch(3).await.is_none());
    }

    #[tokio::test]
    async fn test_source_failure() {
        let source = FakeSource::new();
        source.reply(
            STATUS,
            Reply::json(
                200,
                r#"[{"relation": "issues", "status": -1, "error": "permission denied"}]"#,
            ),
        );

        let status = export_status(&source);
        assert!(status.failed().await);
        assert!(!status.unavailable().await);
        assert_eq!(Some("permission denied".to_string()), status.error().await);
    }

    #[tokio::test]
    async fn test_synthesized_failure() {
        // Missing relation
        let source = FakeSource::new();
        source.reply(STATUS, Reply::json(200, r#"[{"relation": "labels", "status": 1}]"#));
        let status = export_status(&source);
        assert!(status.failed().await);
        assert!(status.unavailable().await);
        assert_eq!(Some(EMPTY_STATUS_ERROR.to_string()), status.error().await);

        // Empty body
        let source = FakeSource::new();
        source.reply(STATUS, Reply::json(200, ""));
        let status = export_status(&source);
        assert_eq!(Some(EMPTY_STATUS_ERROR.to_string()), status.error().await);

        // Malformed body
        let source = FakeSource::new();
        source.reply(STATUS, Reply::json(200, "<html>"));
        let status = export_status(&source);
        assert!(status.failed().await);
        assert!(status.error().await.unwrap().contains("malformed"));

        // Transport errors are retried, then reported
        let source = FakeSource::new();
        source.reply(STATUS, Reply::TransportError);
        let status = export_status(&source);
        assert!(status.failed().await);
        assert!(!status.started().await);
        assert!(status
            .error()
            .await
            .unwrap()
            .contains("connection reset by peer"));
        assert_eq!(2, source.count(STATUS));

        // Unknown status code
        let source = FakeSource::new();
        source.reply(STATUS, Reply::json(200, r#"[{"relation": "issues", "status": 9}]"#));
        assert!(export_status(&source).unavailable().await);
    }
}

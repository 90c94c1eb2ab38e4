//! Downloading relation data.
//!
//! The source serves relation data as newline-delimited JSON, either
//! gzip-compressed or plain. A batched export is downloaded one batch
//! per page, and the source reports the following page in the
//! `X-Next-Page` header.

use async_compression::tokio::bufread::GzipDecoder;
use displaydoc::Display;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::io::AsyncReadExt;

use super::{with_backoff, HttpResponse, SourceClient, SourceError, SourceRequest};
use crate::config::RetryConfig;
use ferry::api::v1::export_relations::{export_relations_segments, NEXT_PAGE_HEADER};
use ferry::relation::PortableType;

/// Error name the source gives a non-batched download of a batched export.
const EXPORT_IS_BATCHED: &str = "ExportIsBatched";

/// Magic bytes of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// One page of relation data.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationPage {
    /// The number of the page.
    pub page: i64,

    /// The records on the page, one per NDJSON line.
    pub records: Vec<Value>,

    /// The page to fetch next, if any.
    pub next_page: Option<i64>,
}

/// An error fetching relation data.
#[derive(Debug, Display)]
pub enum FetchError {
    /// Transient error: {0}
    Transient(SourceError),

    /// The relation is not applicable on the source: {0}
    NotApplicable(String),

    /// The data is not available on the source: {0}
    Missing(String),

    /// The export changed on the source since its status was read: {0}
    Changed(String),

    /// {0}
    Fatal(String),
}

/// Fetches relation data of one portable from the source.
pub struct RelationSource<'a> {
    client: &'a dyn SourceClient,
    retry: &'a RetryConfig,
}

impl From<SourceError> for FetchError {
    fn from(error: SourceError) -> Self {
        match error {
            e if e.is_transient() => Self::Transient(e),
            SourceError::Status(StatusCode::CONFLICT, body) => Self::Changed(body),
            SourceError::Status(StatusCode::BAD_REQUEST, body)
                if error_name(&body).as_deref() == Some(EXPORT_IS_BATCHED) =>
            {
                Self::Changed(body)
            }
            SourceError::Status(StatusCode::BAD_REQUEST, body) => Self::NotApplicable(body),
            SourceError::Status(StatusCode::NOT_FOUND, body) => Self::Missing(body),
            e => Self::Fatal(e.to_string()),
        }
    }
}

impl FetchError {
    /// Returns the name of the error kind, for failure records.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transient(_) => "TransientError",
            Self::NotApplicable(_) => "NotApplicable",
            Self::Missing(_) => "MissingData",
            Self::Changed(_) => "ExportChanged",
            Self::Fatal(_) => "FatalError",
        }
    }
}

impl<'a> RelationSource<'a> {
    pub fn new(client: &'a dyn SourceClient, retry: &'a RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Fetches one page of a relation.
    ///
    /// Pages of a batched export are its batches. Other exports are
    /// paginated only if the source says so.
    pub async fn fetch_page(
        &self,
        portable_type: PortableType,
        source_id: &str,
        relation: &str,
        batched: bool,
        page: i64,
    ) -> Result<RelationPage, FetchError> {
        let mut request = SourceRequest::new(export_relations_segments(portable_type, source_id))
            .segment("download")
            .param("relation", relation);

        if batched {
            request = request
                .param("batched", "true")
                .param("batch_number", page.to_string());
        } else if page > 1 {
            request = request.param("page", page.to_string());
        }

        let client = self.client;
        let request = &request;
        let response = with_backoff(self.retry, || async move {
            client.get(request).await?.error_for_status()
        })
        .await?;

        let next_page = parse_next_page(&response)?;
        let body = decode_body(&response.body).await?;
        let records = parse_ndjson(&body)?;

        tracing::debug!(
            "Fetched page {} of {} with {} records",
            page,
            relation,
            records.len()
        );

        Ok(RelationPage {
            page,
            records,
            next_page,
        })
    }
}

/// Returns the `error` field of a JSON error body.
fn error_name(body: &str) -> Option<String> {
    let body: Value = serde_json::from_str(body).ok()?;
    body.get("error")?.as_str().map(str::to_string)
}

fn parse_next_page(response: &HttpResponse) -> Result<Option<i64>, FetchError> {
    match response.header(NEXT_PAGE_HEADER).map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => v.parse::<i64>().map(Some).map_err(|_| {
            FetchError::Fatal(format!("Invalid {} header: {:?}", NEXT_PAGE_HEADER, v))
        }),
    }
}

/// Decompresses a body if it is gzip-compressed.
async fn decode_body(body: &[u8]) -> Result<Vec<u8>, FetchError> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(body.to_vec());
    }

    let mut decoder = GzipDecoder::new(body);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .await
        .map_err(|e| FetchError::Fatal(format!("Invalid gzip stream: {}", e)))?;

    Ok(decoded)
}

fn parse_ndjson(body: &[u8]) -> Result<Vec<Value>, FetchError> {
    let body = std::str::from_utf8(body)
        .map_err(|_| FetchError::Fatal("Relation data is not valid UTF-8".to_string()))?;

    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| {
                FetchError::Fatal(format!("Malformed record on line {}: {}", i + 1, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_compression::tokio::bufread::GzipEncoder;
    use bytes::Bytes;
    use tokio_test::block_on;

    use super::*;
    use crate::source::fake::{FakeSource, Reply};

    const DOWNLOAD: &str = "/api/v4/projects/a/b/export_relations/download?relation=issues";

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        }
    }

    async fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzipEncoder::new(data);
        let mut compressed = Vec::new();
        encoder.read_to_end(&mut compressed).await.unwrap();
        compressed.into()
    }

    #[tokio::test]
    async fn test_plain_page() {
        let source = FakeSource::new();
        source.reply(
            DOWNLOAD,
            Reply::json(200, "{\"iid\": 1}\n\n{\"iid\": 2}\n"),
        );

        let retry = retry();
        let page = RelationSource::new(source.as_ref(), &retry)
            .fetch_page(PortableType::Project, "a/b", "issues", false, 1)
            .await
            .unwrap();

        assert_eq!(2, page.records.len());
        assert_eq!(2, page.records[1]["iid"]);
        assert_eq!(None, page.next_page);
    }

    #[test]
    fn test_gzip_batched_page() {
        block_on(async {
            let request = format!("{}&batched=true&batch_number=1", DOWNLOAD);
            let body = gzip(b"{\"iid\": 1}\n").await;

            let source = FakeSource::new();
            source.reply(
                &request,
                Reply::with_headers(200, &[("X-Next-Page", "2")], body),
            );

            let retry = retry();
            let page = RelationSource::new(source.as_ref(), &retry)
                .fetch_page(PortableType::Project, "a/b", "issues", true, 1)
                .await
                .unwrap();

            assert_eq!(1, page.records.len());
            assert_eq!(Some(2), page.next_page);
        });
    }

    #[tokio::test]
    async fn test_errors() {
        let retry = retry();
        let source = FakeSource::new();
        let relation_source = RelationSource::new(source.as_ref(), &retry);

        // Not applicable
        source.reply(DOWNLOAD, Reply::json(400, "{\"message\":\"not supported\"}"));
        let e = relation_source
            .fetch_page(PortableType::Project, "a/b", "issues", false, 1)
            .await
            .unwrap_err();
        assert!(matches!(e, FetchError::NotApplicable(_)));

        // The export was batched after its status was read
        let batched = "{\"error\":\"ExportIsBatched\",\"message\":\"Export is batched\"}";
        for reply in [Reply::json(409, batched), Reply::json(400, batched)] {
            let source = FakeSource::new();
            let relation_source = RelationSource::new(source.as_ref(), &retry);
            source.reply(DOWNLOAD, reply);

            let e = relation_source
                .fetch_page(PortableType::Project, "a/b", "issues", false, 1)
                .await
                .unwrap_err();
            assert!(matches!(e, FetchError::Changed(_)), "{:?}", e);
        }

        // Transient, retried up to the limit
        let source = FakeSource::new();
        let relation_source = RelationSource::new(source.as_ref(), &retry);
        source.reply(DOWNLOAD, Reply::TransportError);
        let e = relation_source
            .fetch_page(PortableType::Project, "a/b", "issues", false, 1)
            .await
            .unwrap_err();
        assert!(matches!(e, FetchError::Transient(_)));
        assert_eq!(2, source.count(DOWNLOAD));

        // Permission denied and malformed bodies are fatal
        for reply in [
            Reply::json(403, "{\"message\":\"403 Forbidden\"}"),
            Reply::json(200, "{\"iid\": 1}\nnot json\n"),
            Reply::with_headers(200, &[("X-Next-Page", "soon")], Bytes::new()),
            Reply::with_headers(200, &[], Bytes::from_static(&[0x1f, 0x8b, 0x00])),
        ] {
            let source = FakeSource::new();
            let relation_source = RelationSource::new(source.as_ref(), &retry);
            source.reply(DOWNLOAD, reply);

            let e = relation_source
                .fetch_page(PortableType::Project, "a/b", "issues", false, 1)
                .await
                .unwrap_err();
            assert!(matches!(e, FetchError::Fatal(_)), "{:?}", e);
        }

        // Missing data
        let e = relation_source
            .fetch_page(PortableType::Project, "a/b", "issues", false, 2)
            .await
            .unwrap_err();
        assert!(matches!(e, FetchError::Missing(_)));
        assert_eq!(1, source.count(&format!("{}&page=2", DOWNLOAD)));
    }
}

//! Relation exports.
//!
//! The source exposes, per portable, the status of its relation exports
//! and a download endpoint for the exported data:
//!
//! - `GET /api/v4/{groups|projects}/:id/export_relations/status`
//! - `GET /api/v4/{groups|projects}/:id/export_relations/download`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::relation::{PortableType, RelationName};
use crate::status::ExportStatusCode;

/// The header carrying the next page of a paginated download.
pub const NEXT_PAGE_HEADER: &str = "x-next-page";

/// Returns the segments of the export-relations path of a portable.
///
/// `id` is either a numeric ID or a full path. The segments are not
/// percent-encoded, so a full path like `a/b` stays a single segment.
pub fn export_relations_segments(portable_type: PortableType, id: &str) -> Vec<String> {
    vec![
        "api".to_string(),
        "v4".to_string(),
        portable_type.export_path_segment().to_string(),
        id.to_string(),
        "export_relations".to_string(),
    ]
}

/// The status of one relation export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationExportStatus {
    /// The name of the relation.
    pub relation: String,

    /// The status of the export.
    pub status: ExportStatusCode,

    /// The error message, if the export failed.
    #[serde(default)]
    pub error: Option<String>,

    /// Whether the relation is exported in batches.
    #[serde(default)]
    pub batched: bool,

    /// The number of batches.
    #[serde(default)]
    pub batches_count: i32,

    /// The total number of objects across all batches.
    #[serde(default)]
    pub total_objects_count: i64,

    /// The status of each batch.
    #[serde(default)]
    pub batches: Vec<BatchExportStatus>,

    /// When the export was last updated.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The status of one batch of a relation export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExportStatus {
    pub batch_number: i32,
    pub status: ExportStatusCode,

    #[serde(default)]
    pub error: Option<String>,

    #[serde(default)]
    pub objects_count: i64,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A status response.
///
/// The endpoint returns a single object when queried for one relation,
/// and a list otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusResponse {
    Many(Vec<RelationExportStatus>),
    One(Box<RelationExportStatus>),
}

/// Query parameters of the status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub relation: Option<RelationName>,
}

/// Query parameters of the download endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadQuery {
    pub relation: RelationName,

    #[serde(default)]
    pub batched: bool,

    #[serde(default)]
    pub batch_number: Option<i32>,
}

impl StatusResponse {
    pub fn into_vec(self) -> Vec<RelationExportStatus> {
        match self {
            Self::Many(statuses) => statuses,
            Self::One(status) => vec![*status],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response() {
        let many = r#"[
            {"relation": "labels", "status": 1, "error": null, "batched": false, "batches_count": 0, "batches": []},
            {"relation": "issues", "status": -1, "error": "permission denied"}
        ]"#;

        let statuses = serde_json::from_str::<StatusResponse>(many)
            .unwrap()
            .into_vec();
        assert_eq!(2, statuses.len());
        assert_eq!(ExportStatusCode::Finished, statuses[0].status);
        assert_eq!(ExportStatusCode::Failed, statuses[1].status);
        assert_eq!(Some("permission denied"), statuses[1].error.as_deref());

        let one = r#"{
            "relation": "issues", "status": 0, "batched": true, "batches_count": 2,
            "batches": [{"batch_number": 1, "status": 1, "objects_count": 1000}]
        }"#;

        let statuses = serde_json::from_str::<StatusResponse>(one)
            .unwrap()
            .into_vec();
        assert_eq!(1, statuses.len());
        assert!(statuses[0].batched);
        assert_eq!(1000, statuses[0].batches[0].objects_count);

        serde_json::from_str::<StatusResponse>(r#"[{"relation": "issues", "status": 7}]"#)
            .unwrap_err();
    }

    #[test]
    fn test_queries() {
        let query: DownloadQuery =
            serde_json::from_str(r#"{"relation": "issues", "batched": true, "batch_number": 2}"#)
                .unwrap();
        assert_eq!("issues", query.relation.as_str());
        assert_eq!(Some(2), query.batch_number);

        let query: StatusQuery = serde_json::from_str("{}").unwrap();
        assert!(query.relation.is_none());

        serde_json::from_str::<DownloadQuery>(r#"{"relation": "../issues"}"#).unwrap_err();
        serde_json::from_str::<StatusQuery>(r#"{"relation": "Issues"}"#).unwrap_err();
    }

    #[test]
    fn test_export_relations_segments() {
        assert_eq!(
            vec!["api", "v4", "projects", "a/b", "export_relations"],
            export_relations_segments(PortableType::Project, "a/b")
        );
        assert_eq!(
            "groups",
            export_relations_segments(PortableType::Group, "12")[2]
        );
    }
}

//! Relation export endpoints.

use axum::body::StreamBody;
use axum::extract::{Extension, Json, Path, Query};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::instrument;

use crate::error::{ServerError, ServerResult};
use crate::State;
use ferry::api::v1::export_relations::{
    DownloadQuery, StatusQuery, StatusResponse, NEXT_PAGE_HEADER,
};
use ferry::relation::PortableType;

/// Gets the status of relation exports.
///
/// With a relation, the status of its export is returned as a single
/// object, or an empty list if it was never exported.
#[instrument(skip_all, fields(portable, id))]
pub(crate) async fn get_status(
    Extension(state): Extension<State>,
    Path((portable, id)): Path<(String, String)>,
    Query(query): Query<StatusQuery>,
) -> ServerResult<Json<StatusResponse>> {
    let service = state.export_service().await?;
    let portable = service
        .resolve(PortableType::from_path_segment(&portable)?, &id)
        .await?;

    let response = match query.relation {
        Some(relation) => {
            service.validate_relation(portable, relation.as_str())?;

            match service
                .statuses(portable, Some(relation.as_str()))
                .await?
                .into_iter()
                .next()
            {
                Some(status) => StatusResponse::One(Box::new(status)),
                None => StatusResponse::Many(Vec::new()),
            }
        }
        None => StatusResponse::Many(service.statuses(portable, None).await?),
    };

    Ok(Json(response))
}

/// Downloads an export artifact.
#[instrument(skip_all, fields(portable, id))]
pub(crate) async fn download(
    Extension(state): Extension<State>,
    Path((portable, id)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> ServerResult<Response> {
    let service = state.export_service().await?;
    let portable = service
        .resolve(PortableType::from_path_segment(&portable)?, &id)
        .await?;
    let download = service.open_download(portable, &query).await?;

    let disposition = format!(
        "attachment; filename=\"{0}\"; filename*=UTF-8''{0}",
        download.filename
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/gzip"),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition).map_err(ServerError::request_error)?,
    );

    if let Some(next_page) = download.next_page {
        headers.insert(
            HeaderName::from_static(NEXT_PAGE_HEADER),
            HeaderValue::from(next_page),
        );
    }

    let body = StreamBody::new(ReaderStream::new(download.stream));

    Ok((headers, body).into_response())
}

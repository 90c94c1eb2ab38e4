mod export_relations;

use axum::{routing::get, Router};

pub(crate) fn get_router() -> Router {
    Router::new()
        .route(
            "/api/v4/:portable/:id/export_relations/status",
            get(export_relations::get_status),
        )
        .route(
            "/api/v4/:portable/:id/export_relations/download",
            get(export_relations::download),
        )
}

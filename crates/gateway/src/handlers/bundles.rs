//! Bundle download

use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
};

use crate::AppState;
use influencemapper_common::errors::Result;

/// GET /v1/bundles/{name}
pub async fn download_bundle(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let data = state.collector.bundles().open(&name).await?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/gzip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        data,
    ))
}

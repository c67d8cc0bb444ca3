//! Upload handler

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use influencemapper_common::{
    errors::{AppError, Result},
    pipeline::UploadReceipt,
    tabular::TableFormat,
};

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    /// `csv` or `tsv`; falls back to the Content-Type, then CSV
    pub format: Option<TableFormat>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    #[serde(flatten)]
    pub receipt: UploadReceipt,
    pub events_url: String,
}

/// Accept a raw CSV/TSV table and start its session
pub async fn create_upload(
    State(state): State<AppState>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let body = body.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge {
                limit: state.config.server.max_upload_bytes,
            }
        } else {
            AppError::InvalidFormat {
                message: rejection.body_text(),
            }
        }
    })?;

    if body.is_empty() {
        return Err(AppError::Validation {
            message: "Upload body is empty".to_string(),
            field: None,
        });
    }

    let format = params
        .format
        .or_else(|| {
            headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .and_then(TableFormat::from_content_type)
        })
        .unwrap_or_default();

    let receipt = state.uploads.submit(&body, format).await?;
    let events_url = format!("/v1/sessions/{}/events", receipt.session_id);

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            receipt,
            events_url,
        }),
    ))
}

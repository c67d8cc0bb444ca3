//! Session progress stream (SSE)

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::{info, warn};

use crate::AppState;
use influencemapper_common::{errors::Result, models::SessionId};

/// Events buffered between the collector and a slow client
const EVENT_BUFFER: usize = 64;

/// GET /v1/sessions/{id}/events - progress stream for one upload
///
/// Streams `progress` per accepted reply, then one of `completed`,
/// `stalled` or `failed`. Unknown sessions are rejected before streaming;
/// closing the connection cancels the session's collector.
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let session_id: SessionId = id.parse()?;
    let prepared = state.collector.prepare(session_id).await?;
    info!(session_id = %session_id, expected = prepared.expected_total, "Progress stream opened");

    let (mut rx, _collector) = state.collector.spawn(prepared, EVENT_BUFFER);

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            match Event::default().event(event.name()).json_data(&event) {
                Ok(sse) => yield Ok(sse),
                Err(e) => warn!(session_id = %session_id, error = %e, "Failed to encode progress event"),
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

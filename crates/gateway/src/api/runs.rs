//! Run endpoints.
//!
//! - `POST /threads/:id/runs`            — start a run (does not stream)
//! - `GET  /threads/:id/runs`            — run history for the thread
//! - `GET  /threads/:id/runs/events`     — long-lived SSE stream with resume cursor
//! - `POST /threads/:id/runs/cancel`     — cooperative cancel
//! - `GET  /threads/:id/runtime`         — supervisor/monitor snapshot

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::StreamExt;
use serde::Deserialize;

use crate::runtime::producer;
use crate::state::AppState;

use super::error_response;

#[derive(Debug, Deserialize)]
pub struct StartRunBody {
    pub message: String,
    #[serde(default)]
    pub enable_trajectory: Option<bool>,
}

pub async fn start_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<StartRunBody>,
) -> impl IntoResponse {
    if body.message.trim().is_empty() {
        return error_response(leon_domain::Error::Validation("message is empty".into()));
    }
    match producer::start_run(&state, &thread_id, &body.message).await {
        Ok(run) => Json(serde_json::json!({
            "run_id": run.run_id,
            "thread_id": run.thread_id,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Resume cursor: only events with `seq > after` are delivered.
    #[serde(default)]
    pub after: u64,
}

pub async fn run_events_sse(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let stream = match state.supervisor.observe(&thread_id, query.after) {
        Ok(stream) => stream,
        Err(e) => return error_response(e),
    };

    let sse_stream = stream.map(|item| match item {
        Ok(evt) => Ok::<_, std::convert::Infallible>(
            Event::default()
                .event(evt.event_type.as_str())
                .data(evt.wire_data().to_string()),
        ),
        Err(e) => Ok(Event::default().event("error").data(
            serde_json::json!({
                "message": e.to_string(),
                "kind": e.kind(),
            })
            .to_string(),
        )),
    });

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

pub async fn list_runs(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    match state.supervisor.run_store().list_for_thread(&thread_id) {
        Ok(runs) => Json(serde_json::json!({ "runs": runs })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    let ok = state.supervisor.cancel_run(&thread_id);
    Json(serde_json::json!({ "ok": ok })).into_response()
}

pub async fn runtime_status(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    match state.threads.get(&thread_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(leon_domain::Error::thread_not_found(&thread_id)),
        Err(e) => return error_response(e),
    }
    match state.supervisor.runtime_status(&thread_id) {
        Ok(status) => Json(serde_json::json!(status)).into_response(),
        Err(e) => error_response(e),
    }
}

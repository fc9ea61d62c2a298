//! Queue-routed message intake.
//!
//! - `POST /threads/:id/messages` — the router decides between immediate
//!   dispatch, followup queueing, collecting, steering into the live run,
//!   or interrupt-and-replace.
//! - `GET /threads/:id/queue` — the thread's mailbox (operator view;
//!   backlogged messages of suspended threads show up here).

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::runtime::queue;
use crate::state::AppState;

use super::error_response;

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub message: String,
    /// Explicit user override: cancel the running run and dispatch.
    #[serde(default)]
    pub interrupt: bool,
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Json(body): Json<PostMessageBody>,
) -> impl IntoResponse {
    if body.message.trim().is_empty() {
        return error_response(leon_domain::Error::Validation("message is empty".into()));
    }
    match queue::route_message(&state, &thread_id, &body.message, body.interrupt).await {
        Ok(routing) => {
            let mut out = serde_json::json!({ "status": "accepted" });
            if let (Some(map), serde_json::Value::Object(extra)) =
                (out.as_object_mut(), serde_json::json!(routing))
            {
                map.extend(extra);
            }
            Json(out).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn list_queue(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    match state.queue.list(&thread_id) {
        Ok(messages) => Json(serde_json::json!({
            "thread_id": thread_id,
            "pending_steer": state.router.pending_steer(&thread_id),
            "messages": messages,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

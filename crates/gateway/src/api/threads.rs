//! Thread CRUD.
//!
//! - `POST   /threads`       — create a thread bound to a sandbox provider
//! - `GET    /threads`       — list threads
//! - `GET    /threads/:id`   — thread detail + messages from the latest checkpoint
//! - `DELETE /threads/:id`   — destructive cascade (instances included)

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use leon_domain::Error;
use leon_store::{CheckpointConfig, ThreadRecord};

use crate::state::AppState;

use super::error_response;

#[derive(Debug, Deserialize)]
pub struct CreateThreadBody {
    /// Sandbox provider name ("mem", "local", ...).
    pub sandbox: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_thread(
    State(state): State<AppState>,
    Json(body): Json<CreateThreadBody>,
) -> impl IntoResponse {
    if !state.sandboxes.contains(&body.sandbox) {
        return error_response(Error::Validation(format!(
            "unknown sandbox provider: {}",
            body.sandbox
        )));
    }

    let mut thread = ThreadRecord::new(&body.sandbox);
    thread.title = body.title;
    thread.agent = body.agent;
    thread.cwd = body.cwd;
    if let Err(e) = state.threads.create(&thread) {
        return error_response(e);
    }
    tracing::info!(thread_id = %thread.thread_id, sandbox = %thread.sandbox_provider, "thread created");

    Json(serde_json::json!({
        "thread_id": thread.thread_id,
        "sandbox": thread.sandbox_provider,
        "agent": thread.agent,
        "cwd": thread.cwd,
        "created_at": thread.created_at,
    }))
    .into_response()
}

pub async fn list_threads(State(state): State<AppState>) -> impl IntoResponse {
    match state.threads.list() {
        Ok(threads) => Json(serde_json::json!({ "threads": threads })).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    let thread = match state.threads.get(&thread_id) {
        Ok(Some(thread)) => thread,
        Ok(None) => return error_response(Error::thread_not_found(&thread_id)),
        Err(e) => return error_response(e),
    };

    // Checkpoints are the source of truth for messages.
    let messages = match state.checkpoints.get(&CheckpointConfig::latest(&thread_id)) {
        Ok(Some(checkpoint)) => checkpoint.messages,
        Ok(None) => Vec::new(),
        Err(e) => return error_response(e),
    };
    let messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "id": m.id,
                "type": m.role,
                "content": m.text(),
                "tool_calls": if m.tool_calls.is_empty() { None } else { Some(&m.tool_calls) },
                "tool_call_id": m.tool_call_id,
            })
        })
        .collect();

    Json(serde_json::json!({
        "thread_id": thread.thread_id,
        "title": thread.title,
        "agent": thread.agent,
        "sandbox": thread.sandbox_provider,
        "created_at": thread.created_at,
        "messages": messages,
    }))
    .into_response()
}

pub async fn delete_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    match state.threads.get(&thread_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(Error::thread_not_found(&thread_id)),
        Err(e) => return error_response(e),
    }

    // Stop any live run before tearing the thread down, waiting out the
    // cancel grace period so the producer stops writing rows.
    if state.supervisor.is_busy(&thread_id) {
        state.supervisor.cancel_run(&thread_id);
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(state.config.runs.cancel_grace_secs + 2);
        while state.supervisor.is_busy(&thread_id) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
    }

    match state.resolver.delete_thread(&state.db, &thread_id).await {
        Ok(()) => {
            state.supervisor.machines.remove(&thread_id);
            state.supervisor.monitors.remove(&thread_id);
            tracing::info!(thread_id, "thread deleted");
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => error_response(e),
    }
}

//! Operator views: health, orphan instances, leases and their events.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use leon_domain::Error;
use leon_sandbox::scan_orphans;

use crate::state::AppState;

use super::error_response;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "default_model": state.config.model.default_model,
        "sandbox_providers": state.sandboxes.names(),
    }))
}

// ── Orphans ─────────────────────────────────────────────────────────

pub async fn list_orphans(State(state): State<AppState>) -> impl IntoResponse {
    let report = scan_orphans(&state.sandboxes, state.resolver.store()).await;
    Json(serde_json::json!(report))
}

#[derive(Debug, Deserialize)]
pub struct AdoptBody {
    pub thread_id: String,
    pub provider: String,
    pub instance_id: String,
}

pub async fn adopt_orphan(
    State(state): State<AppState>,
    Json(body): Json<AdoptBody>,
) -> impl IntoResponse {
    let thread = match state.threads.get(&body.thread_id) {
        Ok(Some(thread)) => thread,
        Ok(None) => return error_response(Error::thread_not_found(&body.thread_id)),
        Err(e) => return error_response(e),
    };
    match state
        .resolver
        .adopt_orphan(&thread, &body.provider, &body.instance_id)
        .await
    {
        Ok(lease) => Json(serde_json::json!({
            "lease_id": lease.lease_id,
            "session_id": lease.session_id,
            "instance_id": lease.instance_id,
            "observed_state": lease.observed_state,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct DestroyBody {
    pub provider: String,
    pub instance_id: String,
}

pub async fn destroy_orphan(
    State(state): State<AppState>,
    Json(body): Json<DestroyBody>,
) -> impl IntoResponse {
    match state
        .resolver
        .destroy_orphan(&body.provider, &body.instance_id)
        .await
    {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => error_response(e),
    }
}

/// Summary audit trail for a thread (older rows stay inactive).
pub async fn list_summaries(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> impl IntoResponse {
    match state.summaries.list(&thread_id) {
        Ok(summaries) => Json(serde_json::json!({ "summaries": summaries })).into_response(),
        Err(e) => error_response(e),
    }
}

// ── Leases ──────────────────────────────────────────────────────────

pub async fn list_leases(State(state): State<AppState>) -> impl IntoResponse {
    match state.resolver.store().list_leases() {
        Ok(leases) => Json(serde_json::json!({ "leases": leases })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LeaseEventsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn lease_events(
    State(state): State<AppState>,
    Path(lease_id): Path<uuid::Uuid>,
    Query(query): Query<LeaseEventsQuery>,
) -> impl IntoResponse {
    match state
        .resolver
        .store()
        .lease_events(lease_id, query.limit.min(500))
    {
        Ok(events) => Json(serde_json::json!({ "events": events })).into_response(),
        Err(e) => error_response(e),
    }
}

pub mod admin;
pub mod messages;
pub mod runs;
pub mod threads;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use leon_domain::{Error, ErrorKind};

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Threads
        .route("/threads", post(threads::create_thread))
        .route("/threads", get(threads::list_threads))
        .route("/threads/:id", get(threads::get_thread))
        .route("/threads/:id", delete(threads::delete_thread))
        .route("/threads/:id/runtime", get(runs::runtime_status))
        // Runs
        .route("/threads/:id/runs", post(runs::start_run).get(runs::list_runs))
        .route("/threads/:id/runs/events", get(runs::run_events_sse))
        .route("/threads/:id/runs/cancel", post(runs::cancel_run))
        // Queue-routed messages
        .route("/threads/:id/messages", post(messages::post_message))
        .route("/threads/:id/queue", get(messages::list_queue))
        // Operator views
        .route("/admin/health", get(admin::health))
        .route("/admin/orphans", get(admin::list_orphans))
        .route("/admin/orphans/adopt", post(admin::adopt_orphan))
        .route("/admin/orphans/destroy", post(admin::destroy_orphan))
        .route("/admin/leases", get(admin::list_leases))
        .route("/admin/leases/:id/events", get(admin::lease_events))
        .route("/admin/threads/:id/summaries", get(admin::list_summaries))
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Map runtime errors onto HTTP responses; the body always carries the
/// error kind so clients can branch without parsing text.
pub fn error_response(e: Error) -> Response {
    let status = match e.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::TransientUpstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Corruption | ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        })),
    )
        .into_response()
}

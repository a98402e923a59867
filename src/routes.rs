use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::{handlers, state::AppState};

/// Builds the HTTP ingress.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/classes/active", get(handlers::classes::active_classes))
        .route(
            "/api/classes/{class_id}/start",
            post(handlers::classes::start_generation),
        )
        .route(
            "/api/classes/{class_id}/stop",
            post(handlers::classes::stop_generation),
        )
        .route(
            "/api/classes/{class_id}/token",
            get(handlers::classes::current_token),
        )
        .route("/api/scan", post(handlers::scan::submit_scan))
        .route("/api/attendance", get(handlers::attendance::list_attendance))
        .route(
            "/api/attendance/manual",
            post(handlers::attendance::record_manual).delete(handlers::attendance::delete_manual),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default())
                .on_request(DefaultOnRequest::default().level(Level::DEBUG))
                .on_response(DefaultOnResponse::default().level(Level::DEBUG))
                .on_failure(DefaultOnFailure::default().level(Level::ERROR)),
        )
        .with_state(state)
}

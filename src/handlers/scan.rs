use axum::{extract::State, http::StatusCode, response::Response, Json};
use chrono::Utc;
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    handlers::response::{json, validated},
    models::events::{validate_id, ScanValidation, Topic},
    state::AppState,
};

/// The request payload for a student's scan.
#[derive(Debug, Deserialize, Validate)]
pub struct ScanRequest {
    #[garde(length(min = 1, max = 4096))]
    #[serde(alias = "encryptedQR")]
    pub encrypted_token: String,
    #[garde(length(min = 1, max = 128))]
    #[serde(alias = "studentId")]
    pub student_id: String,
}

#[derive(Serialize)]
struct ScanResponse {
    status: &'static str,
    message: &'static str,
}

/// Accepts a scanned QR code and queues it for validation.
///
/// The token is decrypted here only to route the request; the validation
/// listener repeats every check against the token store.
#[axum::debug_handler]
pub async fn submit_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Response> {
    validated(&req)?;
    validate_id("student_id", &req.student_id)?;

    let token = state.codec.decrypt(&req.encrypted_token)?;
    let request = ScanValidation::new(&token.id, &token.class_id, &req.student_id, Utc::now());
    state
        .bus
        .publish(Topic::ScanValidation, &request.encode()?)
        .await?;

    tracing::info!(
        "📥 Scan submitted: class={}, student={}",
        request.class_id,
        request.student_id
    );

    json(
        StatusCode::ACCEPTED,
        &ScanResponse {
            status: "pending",
            message: "Validation request submitted",
        },
    )
}

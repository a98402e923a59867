use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Response,
    Json,
};
use chrono::Utc;
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    handlers::response::{json, validated},
    models::attendance::AttendanceRecord,
    services::attendance::{self as attendance_service, ManualEntry},
    state::AppState,
};

/// The request payload for registering attendance by hand.
#[derive(Debug, Deserialize, Validate)]
pub struct ManualAttendanceRequest {
    #[garde(length(min = 1, max = 128))]
    #[serde(alias = "professor_id")]
    pub teacher_id: String,
    #[garde(length(min = 1, max = 128))]
    pub student_id: String,
    #[garde(length(min = 1, max = 128))]
    pub class_id: String,
    #[garde(length(min = 1, max = 128))]
    pub section_id: String,
    #[garde(length(min = 1, max = 128))]
    pub module_id: String,
}

/// Query parameters for reading a section's attendance.
#[derive(Debug, Deserialize, Validate)]
pub struct AttendanceQuery {
    #[garde(length(min = 1, max = 128))]
    pub section_id: String,
    #[garde(length(min = 1, max = 128))]
    pub student_id: Option<String>,
}

/// Query parameters for removing a section's manual records.
#[derive(Debug, Deserialize, Validate)]
pub struct SectionQuery {
    #[garde(length(min = 1, max = 128))]
    pub section_id: String,
}

#[derive(Serialize)]
struct AttendanceListResponse<'a> {
    section_id: &'a str,
    records: Vec<AttendanceRecord>,
}

#[derive(Serialize)]
struct DeletedResponse<'a> {
    section_id: &'a str,
    deleted: u64,
}

/// Records a student as present without a scan.
#[axum::debug_handler]
pub async fn record_manual(
    State(state): State<AppState>,
    Json(req): Json<ManualAttendanceRequest>,
) -> Result<Response> {
    validated(&req)?;

    let entry = ManualEntry {
        teacher_id: req.teacher_id,
        student_id: req.student_id,
        class_id: req.class_id,
        section_id: req.section_id,
        module_id: req.module_id,
    };
    let record = attendance_service::record_manual(state.repo.as_ref(), &entry, Utc::now()).await?;

    json(StatusCode::CREATED, &record)
}

/// Lists a section's attendance, optionally for a single student.
#[axum::debug_handler]
pub async fn list_attendance(
    State(state): State<AppState>,
    Query(query): Query<AttendanceQuery>,
) -> Result<Response> {
    validated(&query)?;

    let records =
        attendance_service::list(state.repo.as_ref(), &query.section_id, query.student_id.as_deref()).await?;

    json(
        StatusCode::OK,
        &AttendanceListResponse {
            section_id: &query.section_id,
            records,
        },
    )
}

/// Deletes a section's manual records.
#[axum::debug_handler]
pub async fn delete_manual(
    State(state): State<AppState>,
    Query(query): Query<SectionQuery>,
) -> Result<Response> {
    validated(&query)?;

    let deleted = attendance_service::delete_manual(state.repo.as_ref(), &query.section_id).await?;

    json(
        StatusCode::OK,
        &DeletedResponse {
            section_id: &query.section_id,
            deleted,
        },
    )
}

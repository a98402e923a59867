use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::{AppError, Result};

/// Serializes `body` with sonic-rs into a JSON response.
pub fn json<T: Serialize>(status: StatusCode, body: &T) -> Result<Response> {
    let body = sonic_rs::to_string(body)
        .map_err(|e| AppError::Internal(format!("Response serialization failed: {}", e)))?;

    Ok((status, [(header::CONTENT_TYPE, "application/json")], body).into_response())
}

/// Maps garde's report to a `Validation` error.
pub fn validated<T: garde::Validate<Context = ()>>(payload: &T) -> Result<()> {
    payload
        .validate()
        .map_err(|report| AppError::Validation(report.to_string()))
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The application's error type.
///
/// Codec and verification errors are terminal for the single request or
/// generation cycle they arose in. They never carry key material.
#[derive(Error, Debug)]
pub enum AppError {
    /// The token payload could not be sealed.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Authentication tag mismatch, wrong key or tampered ciphertext.
    #[error("Decryption failed")]
    Decryption,

    /// Input that is not a well-formed token or event payload.
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The token store could not be reached.
    #[error("Token store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    /// A resource not found error.
    #[error("Resource not found")]
    NotFound,

    /// The scanned token is not (or no longer) in the token store.
    #[error("Token expired or unknown")]
    TokenExpiredOrUnknown,

    /// The teacher or student does not exist or is inactive.
    #[error("Principal not found or inactive: {0}")]
    PrincipalNotFound(String),

    /// The class section does not exist or is inactive.
    #[error("Class not found or inactive: {0}")]
    ClassNotFound(String),

    /// The module does not exist.
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    /// The student is not enrolled in the section.
    #[error("Student {student_id} is not enrolled in section {section_id}")]
    NotEnrolled {
        student_id: String,
        section_id: String,
    },

    /// Attendance already exists for the student, section and day.
    #[error("Attendance already recorded for student {student_id} in section {section_id}")]
    AlreadyRecorded {
        student_id: String,
        section_id: String,
    },

    /// The timestamp falls outside the section's attendance window.
    #[error("Timestamp is outside the attendance window of section {0}")]
    OutsideWindow(String),

    /// Another class of the same teacher and module minted a token recently.
    #[error("An active token already exists for teacher {teacher_id} and module {module_id}")]
    ActiveTokenExists {
        teacher_id: String,
        module_id: String,
    },

    /// Token generation is already running for the class.
    #[error("Token generation already active for class {0}")]
    SessionAlreadyActive(String),

    /// The persistence collaborator failed. Never a business-rule outcome.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The event bus rejected a publish or subscribe.
    #[error("Publish failure: {0}")]
    Publish(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl From<tokio_postgres::Error> for AppError {
    fn from(e: tokio_postgres::Error) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for AppError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for AppError {
    fn from(e: deadpool_postgres::CreatePoolError) -> Self {
        AppError::Persistence(e.to_string())
    }
}

impl AppError {
    /// Whether this error is a business-rule rejection rather than an
    /// infrastructure failure.
    pub fn is_rule_violation(&self) -> bool {
        matches!(
            self,
            AppError::TokenExpiredOrUnknown
                | AppError::PrincipalNotFound(_)
                | AppError::ClassNotFound(_)
                | AppError::ModuleNotFound(_)
                | AppError::NotEnrolled { .. }
                | AppError::AlreadyRecorded { .. }
                | AppError::OutsideWindow(_)
                | AppError::ActiveTokenExists { .. }
                | AppError::SessionAlreadyActive(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Encryption(ref msg) => {
                tracing::error!("Encryption error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Encryption error".to_string())
            }

            AppError::Decryption => {
                tracing::debug!("Rejected token: {}", self);
                (StatusCode::BAD_REQUEST, "Invalid token".to_string())
            }

            AppError::MalformedInput(ref msg) => {
                tracing::debug!("Malformed input: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::StoreUnavailable(ref e) => {
                tracing::error!("Redis error: {}", e);
                (StatusCode::SERVICE_UNAVAILABLE, "Token store unavailable".to_string())
            }

            AppError::NotFound => {
                tracing::debug!("Resource not found");
                (StatusCode::NOT_FOUND, "Resource not found".to_string())
            }

            AppError::TokenExpiredOrUnknown => {
                tracing::debug!("Token expired or unknown");
                (StatusCode::GONE, self.to_string())
            }

            AppError::PrincipalNotFound(_)
            | AppError::ClassNotFound(_)
            | AppError::ModuleNotFound(_) => {
                tracing::debug!("{}", self);
                (StatusCode::NOT_FOUND, self.to_string())
            }

            AppError::NotEnrolled { .. } => {
                tracing::debug!("{}", self);
                (StatusCode::FORBIDDEN, self.to_string())
            }

            AppError::AlreadyRecorded { .. }
            | AppError::ActiveTokenExists { .. }
            | AppError::SessionAlreadyActive(_) => {
                tracing::debug!("{}", self);
                (StatusCode::CONFLICT, self.to_string())
            }

            AppError::OutsideWindow(_) => {
                tracing::debug!("{}", self);
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }

            AppError::Persistence(ref msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }

            AppError::Publish(ref msg) => {
                tracing::error!("Publish error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "Failed to submit request".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (status, [(http::header::CONTENT_TYPE, "application/json")], body).into_response()
    }
}

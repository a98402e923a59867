use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Json,
};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    handlers::response::{json, validated},
    models::events::{validate_id, ControlEvent, StartCommand, Topic},
    state::AppState,
};

/// The request payload for starting QR generation.
#[derive(Debug, Deserialize, Validate)]
pub struct StartGenerationRequest {
    #[garde(length(min = 1, max = 128))]
    #[serde(alias = "professor_id")]
    pub teacher_id: String,
    #[garde(length(min = 1, max = 128))]
    pub section_id: String,
    #[garde(length(min = 1, max = 128))]
    pub module_id: String,
}

#[derive(Serialize)]
struct ControlResponse<'a> {
    status: &'a str,
    class_id: &'a str,
}

#[derive(Serialize)]
struct CurrentTokenResponse<'a> {
    class_id: &'a str,
    encrypted_token: &'a str,
}

#[derive(Serialize)]
struct ActiveClassesResponse {
    classes: Vec<String>,
}

/// Publishes a start command for a class. Eligibility is decided by the
/// generator when the command is consumed.
#[axum::debug_handler]
pub async fn start_generation(
    State(state): State<AppState>,
    Path(class_id): Path<String>,
    Json(req): Json<StartGenerationRequest>,
) -> Result<Response> {
    validated(&req)?;

    let command = StartCommand {
        class_id,
        teacher_id: req.teacher_id,
        section_id: req.section_id,
        module_id: req.module_id,
    };
    let event = ControlEvent::start(&command);
    let payload = event.clone().into_command().and_then(|_| event.encode())?;

    state.bus.publish(Topic::GenerationControl, &payload).await?;
    tracing::info!("📤 Start command published for class {}", command.class_id);

    json(
        StatusCode::ACCEPTED,
        &ControlResponse {
            status: "starting",
            class_id: &command.class_id,
        },
    )
}

/// Publishes a stop command for a class.
#[axum::debug_handler]
pub async fn stop_generation(
    State(state): State<AppState>,
    Path(class_id): Path<String>,
) -> Result<Response> {
    validate_id("class_id", &class_id)?;

    let payload = ControlEvent::stop(&class_id).encode()?;
    state.bus.publish(Topic::GenerationControl, &payload).await?;
    tracing::info!("📤 Stop command published for class {}", class_id);

    json(
        StatusCode::ACCEPTED,
        &ControlResponse {
            status: "stopping",
            class_id: &class_id,
        },
    )
}

/// Returns the ciphertext the class display should render as a QR code.
#[axum::debug_handler]
pub async fn current_token(
    State(state): State<AppState>,
    Path(class_id): Path<String>,
) -> Result<Response> {
    validate_id("class_id", &class_id)?;
    let encrypted_token = state.store.current(&class_id).await?;

    json(
        StatusCode::OK,
        &CurrentTokenResponse {
            class_id: &class_id,
            encrypted_token: &encrypted_token,
        },
    )
}

/// Lists the classes this process is generating tokens for.
#[axum::debug_handler]
pub async fn active_classes(State(state): State<AppState>) -> Result<Response> {
    let classes = state.sessions.class_ids().await;
    json(StatusCode::OK, &ActiveClassesResponse { classes })
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// The logical channels carried by the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Start/stop commands for token generation.
    GenerationControl,
    /// Scan validation requests.
    ScanValidation,
}

impl Topic {
    /// The channel name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::GenerationControl => "generation-control",
            Topic::ScanValidation => "scan-validation",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checks an identifier that ends up in a token store key.
pub fn validate_id(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::MalformedInput(format!("{} is required", field)));
    }

    if value.len() > 128 {
        return Err(AppError::MalformedInput(format!(
            "{} must be at most 128 characters",
            field
        )));
    }

    if value.chars().any(|c| c == ':' || c.is_whitespace() || c.is_control()) {
        return Err(AppError::MalformedInput(format!(
            "{} contains forbidden characters",
            field
        )));
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    #[serde(alias = "qr_start")]
    Start,
    #[serde(alias = "qr_stop")]
    Stop,
}

/// A `generation-control` message as it travels on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEvent {
    pub event_type: ControlKind,
    pub class_id: String,
    #[serde(default, alias = "professor_id", skip_serializing_if = "Option::is_none")]
    pub teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
}

/// Everything the generator needs to run a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCommand {
    pub class_id: String,
    pub teacher_id: String,
    pub section_id: String,
    pub module_id: String,
}

/// A decoded, validated control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Start(StartCommand),
    Stop { class_id: String },
}

impl ControlEvent {
    pub fn start(command: &StartCommand) -> Self {
        Self {
            event_type: ControlKind::Start,
            class_id: command.class_id.clone(),
            teacher_id: Some(command.teacher_id.clone()),
            section_id: Some(command.section_id.clone()),
            module_id: Some(command.module_id.clone()),
        }
    }

    pub fn stop(class_id: &str) -> Self {
        Self {
            event_type: ControlKind::Stop,
            class_id: class_id.to_string(),
            teacher_id: None,
            section_id: None,
            module_id: None,
        }
    }

    /// Parses a bus payload. Unknown fields are ignored.
    pub fn decode(payload: &str) -> Result<Self> {
        sonic_rs::from_str(payload)
            .map_err(|e| AppError::MalformedInput(format!("control event: {}", e)))
    }

    pub fn encode(&self) -> Result<String> {
        sonic_rs::to_string(self)
            .map_err(|e| AppError::Internal(format!("Control event serialization failed: {}", e)))
    }

    /// Checks the fields required by the event type.
    pub fn into_command(self) -> Result<ControlCommand> {
        validate_id("class_id", &self.class_id)?;

        match self.event_type {
            ControlKind::Stop => Ok(ControlCommand::Stop {
                class_id: self.class_id,
            }),
            ControlKind::Start => {
                let required = |field: &str, value: Option<String>| -> Result<String> {
                    let value = value.unwrap_or_default();
                    validate_id(field, &value)?;
                    Ok(value)
                };

                Ok(ControlCommand::Start(StartCommand {
                    teacher_id: required("teacher_id", self.teacher_id)?,
                    section_id: required("section_id", self.section_id)?,
                    module_id: required("module_id", self.module_id)?,
                    class_id: self.class_id,
                }))
            }
        }
    }
}

/// A `scan-validation` message: which token a student scanned and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanValidation {
    #[serde(alias = "uuid")]
    pub token_id: String,
    #[serde(alias = "classId")]
    pub class_id: String,
    #[serde(alias = "studentId")]
    pub student_id: String,
    /// Unix seconds, string-typed on the wire.
    #[serde(alias = "ScannTime")]
    pub scan_time: String,
}

impl ScanValidation {
    pub fn new(token_id: &str, class_id: &str, student_id: &str, scan_time: DateTime<Utc>) -> Self {
        Self {
            token_id: token_id.to_string(),
            class_id: class_id.to_string(),
            student_id: student_id.to_string(),
            scan_time: scan_time.timestamp().to_string(),
        }
    }

    /// Parses a bus payload and checks its identifiers.
    pub fn decode(payload: &str) -> Result<Self> {
        let request: Self = sonic_rs::from_str(payload)
            .map_err(|e| AppError::MalformedInput(format!("scan validation: {}", e)))?;

        validate_id("token_id", &request.token_id)?;
        validate_id("class_id", &request.class_id)?;
        validate_id("student_id", &request.student_id)?;
        request.scanned_at()?;

        Ok(request)
    }

    pub fn encode(&self) -> Result<String> {
        sonic_rs::to_string(self)
            .map_err(|e| AppError::Internal(format!("Scan request serialization failed: {}", e)))
    }

    pub fn scanned_at(&self) -> Result<DateTime<Utc>> {
        let seconds: i64 = self
            .scan_time
            .trim()
            .parse()
            .map_err(|_| AppError::MalformedInput(format!("invalid scan time: {}", self.scan_time)))?;

        DateTime::from_timestamp(seconds, 0)
            .ok_or_else(|| AppError::MalformedInput(format!("scan time out of range: {}", seconds)))
    }
}

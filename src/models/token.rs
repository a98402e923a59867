use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::events::StartCommand;

/// A short-lived credential binding a class, section, module and teacher to
/// a unique id.
///
/// The plaintext form only lives in memory on the issuing and consuming
/// sides; everything else sees the sealed ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Unique per issuance (random UUIDv4).
    pub id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub section_id: String,
    pub module_id: String,
    /// The timestamp when the token was minted.
    pub issued_at: DateTime<Utc>,
}

impl Token {
    /// Mints a fresh token for a running session.
    pub fn mint(command: &StartCommand) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            class_id: command.class_id.clone(),
            teacher_id: command.teacher_id.clone(),
            section_id: command.section_id.clone(),
            module_id: command.module_id.clone(),
            issued_at: Utc::now(),
        }
    }
}

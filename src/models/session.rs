use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::events::StartCommand;

/// The live generation loop of one class.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Distinguishes this session from earlier ones of the same class.
    pub session_id: Uuid,
    /// The command that started the session.
    pub command: StartCommand,
    /// Cancelling this token stops the loop.
    pub cancel: CancellationToken,
    /// The timestamp when the session was started.
    pub started_at: DateTime<Utc>,
}

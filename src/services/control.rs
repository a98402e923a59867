use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::bus::{run_subscriber, EventBus};
use crate::models::events::{ControlCommand, ControlEvent, Topic};
use crate::services::generator::TokenGenerator;

/// Consumes `generation-control` messages and drives the generator.
///
/// Messages are handled one at a time so a stop never overtakes the start
/// published before it.
#[derive(Clone)]
pub struct ControlListener {
    generator: TokenGenerator,
    backoff: Duration,
}

impl ControlListener {
    pub fn new(generator: TokenGenerator, backoff: Duration) -> Self {
        Self { generator, backoff }
    }

    pub async fn run(&self, bus: Arc<dyn EventBus>, shutdown: CancellationToken) {
        run_subscriber(bus, Topic::GenerationControl, self.backoff, shutdown, |payload| async move {
            let _ = self.handle_message(&payload).await;
        })
        .await;
    }

    /// Decodes one control message and applies it.
    pub async fn handle_message(&self, payload: &str) -> Result<()> {
        let command = ControlEvent::decode(payload).and_then(ControlEvent::into_command);
        let command = match command {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("⚠️  Discarding control message: {}", e);
                return Err(e);
            }
        };

        match command {
            ControlCommand::Start(start) => {
                self.generator.start(start).await?;
            }
            ControlCommand::Stop { class_id } => {
                self.generator.stop(&class_id).await;
            }
        }
        Ok(())
    }
}

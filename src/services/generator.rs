use chrono::Utc;
use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QrSettings;
use crate::crypto::token::TokenCodec;
use crate::error::Result;
use crate::models::attendance::TokenIssue;
use crate::models::events::{validate_id, StartCommand};
use crate::models::session::ActiveSession;
use crate::models::token::Token;
use crate::repositories::attendance::AttendanceRepository;
use crate::services::sessions::SessionRegistry;
use crate::services::verification::{VerificationChain, VerificationContext};
use crate::storage::token_store::TokenStore;

/// Runs one token-minting loop per active class.
#[derive(Clone)]
pub struct TokenGenerator {
    codec: Arc<TokenCodec>,
    store: Arc<dyn TokenStore>,
    repo: Arc<dyn AttendanceRepository>,
    sessions: SessionRegistry,
    settings: QrSettings,
    chain: VerificationChain,
    shutdown: CancellationToken,
}

impl TokenGenerator {
    /// Creates a new `TokenGenerator`.
    ///
    /// # Arguments
    ///
    /// * `codec` - Seals minted tokens.
    /// * `store` - Receives every minted token.
    /// * `repo` - Answers the eligibility checks and logs mints.
    /// * `sessions` - The registry of running loops.
    /// * `settings` - Interval, TTL and cooldown.
    /// * `shutdown` - Process-level cancellation; session tokens are its children.
    pub fn new(
        codec: Arc<TokenCodec>,
        store: Arc<dyn TokenStore>,
        repo: Arc<dyn AttendanceRepository>,
        sessions: SessionRegistry,
        settings: QrSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let chain = VerificationChain::generation(&settings);
        Self {
            codec,
            store,
            repo,
            sessions,
            settings,
            chain,
            shutdown,
        }
    }

    /// Starts generation for a class.
    ///
    /// The registry slot is reserved before the eligibility checks run, so
    /// two concurrent starts for the same class cannot both succeed. The
    /// first token is minted before this returns.
    ///
    /// # Returns
    ///
    /// The id of the new session, `SessionAlreadyActive`, or the failing
    /// eligibility check's error.
    pub async fn start(&self, command: StartCommand) -> Result<Uuid> {
        if let Err(e) = validate_id("class_id", &command.class_id) {
            tracing::warn!("⚠️  Start refused for class {:?}: {}", command.class_id, e);
            return Err(e);
        }

        let session = ActiveSession {
            session_id: Uuid::new_v4(),
            command: command.clone(),
            cancel: self.shutdown.child_token(),
            started_at: Utc::now(),
        };
        if let Err(e) = self.sessions.try_insert(session.clone()).await {
            tracing::warn!("⚠️  Start refused for class {}: {}", command.class_id, e);
            return Err(e);
        }

        let ctx = VerificationContext::for_generation(&command, Utc::now());
        if let Err(e) = self.chain.verify(self.repo.as_ref(), &ctx).await {
            self.sessions.remove_if(&command.class_id, session.session_id).await;
            tracing::warn!("⚠️  Refusing to start generation for class {}: {}", command.class_id, e);
            return Err(e);
        }

        tracing::info!(
            "▶️  QR generation started for class {} (teacher {}, section {}, module {})",
            command.class_id,
            command.teacher_id,
            command.section_id,
            command.module_id
        );

        if let Err(e) = self.mint(&command).await {
            tracing::error!("❌ First mint failed for class {}: {}", command.class_id, e);
        }

        let session_id = session.session_id;
        let generator = self.clone();
        tokio::spawn(async move { generator.run_session(session).await });

        Ok(session_id)
    }

    /// Stops generation for a class. Tokens already minted stay valid until
    /// their TTL runs out.
    ///
    /// # Returns
    ///
    /// `true` if a session was running.
    pub async fn stop(&self, class_id: &str) -> bool {
        match self.sessions.remove(class_id).await {
            Some(session) => {
                session.cancel.cancel();
                tracing::info!("⏹️  QR generation stopped for class {}", class_id);
                true
            }
            None => {
                tracing::debug!("No active generation for class {}", class_id);
                false
            }
        }
    }

    async fn run_session(self, session: ActiveSession) {
        let command = &session.command;
        let period = self.settings.interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = session.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let ctx = VerificationContext::for_generation(command, Utc::now());
                    if let Err(e) = self.chain.verify(self.repo.as_ref(), &ctx).await {
                        tracing::warn!(
                            "⚠️  Verification failed for class {}: {}; skipping this cycle",
                            command.class_id,
                            e
                        );
                        continue;
                    }

                    if let Err(e) = self.mint(command).await {
                        tracing::error!("❌ Mint failed for class {}: {}", command.class_id, e);
                    }
                }
            }
        }

        self.sessions.remove_if(&command.class_id, session.session_id).await;
        tracing::debug!("Generation loop for class {} exited", command.class_id);
    }

    /// Mints one token: seal it, store it under its own key and as the
    /// class's current token, and log the issue.
    pub async fn mint(&self, command: &StartCommand) -> Result<Token> {
        let token = Token::mint(command);
        let ciphertext = self.codec.encrypt(&token)?;
        let ttl = self.settings.token_ttl;

        self.store.put(&token.class_id, &token.id, &ciphertext, ttl).await?;
        self.store.set_current(&token.class_id, &ciphertext, ttl).await?;

        let issue = TokenIssue {
            teacher_id: token.teacher_id.clone(),
            module_id: token.module_id.clone(),
            class_id: token.class_id.clone(),
            issued_at: token.issued_at,
        };
        if let Err(e) = self.repo.record_token_issue(&issue).await {
            tracing::warn!("⚠️  Failed to log token issue for class {}: {}", token.class_id, e);
        }

        tracing::info!("🔑 Token minted: class={}, token_id={}", token.class_id, token.id);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes;
    use crate::error::AppError;
    use crate::repositories::memory::MemoryAttendanceRepository;
    use crate::storage::memory::MemoryTokenStore;
    use std::time::Duration;

    fn command() -> StartCommand {
        StartCommand {
            class_id: "C1".into(),
            teacher_id: "T1".into(),
            section_id: "S1".into(),
            module_id: "M1".into(),
        }
    }

    fn setup(interval: Duration) -> (TokenGenerator, MemoryTokenStore, MemoryAttendanceRepository, SessionRegistry) {
        let store = MemoryTokenStore::new();
        let repo = MemoryAttendanceRepository::new();
        repo.add_teacher("T1").add_class("C1").add_module("M1");
        let sessions = SessionRegistry::new();
        let settings = QrSettings {
            interval,
            token_ttl: Duration::from_secs(60),
            ..QrSettings::default()
        };

        let generator = TokenGenerator::new(
            Arc::new(TokenCodec::new(aes::generate_key())),
            Arc::new(store.clone()),
            Arc::new(repo.clone()),
            sessions.clone(),
            settings,
            CancellationToken::new(),
        );
        (generator, store, repo, sessions)
    }

    #[tokio::test]
    async fn start_mints_immediately() {
        let (generator, store, repo, _) = setup(Duration::from_secs(30));
        generator.start(command()).await.unwrap();

        let issues = repo.token_issues();
        assert_eq!(issues.len(), 1);
        assert!(store.current("C1").await.is_ok());
        generator.stop("C1").await;
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_first_session_survives() {
        let (generator, _, _, sessions) = setup(Duration::from_secs(30));
        let first = generator.start(command()).await.unwrap();

        let err = generator.start(command()).await.unwrap_err();
        assert!(matches!(err, AppError::SessionAlreadyActive(_)));
        assert_eq!(sessions.len().await, 1);
        assert_eq!(sessions.get("C1").await.unwrap().session_id, first);
        generator.stop("C1").await;
    }

    #[tokio::test]
    async fn ineligible_start_leaves_no_session() {
        let (generator, _, _, sessions) = setup(Duration::from_secs(30));
        let err = generator
            .start(StartCommand {
                teacher_id: "T9".into(),
                ..command()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::PrincipalNotFound(_)));
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn loop_keeps_minting_until_stopped() {
        let (generator, _, repo, sessions) = setup(Duration::from_millis(50));
        generator.start(command()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(generator.stop("C1").await);
        let minted = repo.token_issues().len();
        assert!(minted >= 3, "only {} mints", minted);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(repo.token_issues().len(), minted);
        assert!(sessions.is_empty().await);
        assert!(!generator.stop("C1").await);
    }

    #[tokio::test]
    async fn failed_recheck_skips_cycle_but_keeps_session() {
        let (generator, _, repo, sessions) = setup(Duration::from_millis(40));
        generator.start(command()).await.unwrap();

        repo.remove_class("C1");
        tokio::time::sleep(Duration::from_millis(130)).await;
        assert_eq!(repo.token_issues().len(), 1);
        assert!(sessions.contains("C1").await);

        repo.add_class("C1");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(repo.token_issues().len() > 1);
        generator.stop("C1").await;
    }

    #[tokio::test]
    async fn restart_after_stop_is_allowed() {
        let (generator, _, _, sessions) = setup(Duration::from_secs(30));
        let first = generator.start(command()).await.unwrap();
        generator.stop("C1").await;

        let second = generator.start(command()).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(sessions.len().await, 1);
        generator.stop("C1").await;
    }
}

use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, QrSettings};
use crate::crypto::token::TokenCodec;
use crate::error::Result;
use crate::events::bus::{EventBus, RedisEventBus};
use crate::repositories::attendance::{AttendanceRepository, PgAttendanceRepository};
use crate::services::control::ControlListener;
use crate::services::generator::TokenGenerator;
use crate::services::sessions::SessionRegistry;
use crate::services::validation::ValidationListener;
use crate::storage::token_store::{RedisTokenStore, TokenStore};

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// Token generation and validation timings.
    pub settings: QrSettings,
    /// Seals and opens tokens with the pre-shared key.
    pub codec: Arc<TokenCodec>,
    /// Live tokens, keyed by class and token id.
    pub store: Arc<dyn TokenStore>,
    /// Carries control and scan messages between components.
    pub bus: Arc<dyn EventBus>,
    /// Attendance data and the eligibility lookups.
    pub repo: Arc<dyn AttendanceRepository>,
    /// Running generation sessions.
    pub sessions: SessionRegistry,
    /// Cancelled once on shutdown; every session and listener observes it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Creates a new `AppState` backed by PostgreSQL and Redis.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = crate::db::create_pool(&config.database_url)?;
        crate::db::check_connection(&db).await?;
        tracing::info!("✅ PostgreSQL Pool initialized with deadpool-postgres");

        let redis_client = redis::Client::open(config.redis_url.as_str())?;
        let redis = ConnectionManager::new(redis_client.clone()).await?;
        tracing::info!("✅ Redis Connection Manager initialized");

        let codec = TokenCodec::from_key_bytes(config.token_key.as_slice())?;
        tracing::info!("✅ Token codec initialized (AES-256-GCM)");

        Ok(Self::from_parts(
            config.qr.clone(),
            codec,
            Arc::new(RedisTokenStore::new(redis.clone())),
            Arc::new(RedisEventBus::new(redis_client, redis)),
            Arc::new(PgAttendanceRepository::new(db)),
        ))
    }

    /// Assembles a state from explicit collaborators.
    pub fn from_parts(
        settings: QrSettings,
        codec: TokenCodec,
        store: Arc<dyn TokenStore>,
        bus: Arc<dyn EventBus>,
        repo: Arc<dyn AttendanceRepository>,
    ) -> Self {
        Self {
            settings,
            codec: Arc::new(codec),
            store,
            bus,
            repo,
            sessions: SessionRegistry::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn generator(&self) -> TokenGenerator {
        TokenGenerator::new(
            self.codec.clone(),
            self.store.clone(),
            self.repo.clone(),
            self.sessions.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )
    }

    pub fn validation_listener(&self) -> ValidationListener {
        ValidationListener::new(
            self.codec.clone(),
            self.store.clone(),
            self.repo.clone(),
            self.settings.clone(),
        )
    }

    pub fn control_listener(&self) -> ControlListener {
        ControlListener::new(self.generator(), self.settings.reconnect_backoff)
    }

    /// Spawns the control and scan-validation listeners. Both exit when
    /// `shutdown` is cancelled.
    pub fn spawn_listeners(&self) -> Vec<JoinHandle<()>> {
        let control = self.control_listener();
        let (bus, shutdown) = (self.bus.clone(), self.shutdown.clone());
        let control_handle = tokio::spawn(async move { control.run(bus, shutdown).await });

        let validation = self.validation_listener();
        let (bus, shutdown) = (self.bus.clone(), self.shutdown.clone());
        let validation_handle = tokio::spawn(async move { validation.run(bus, shutdown).await });

        tracing::info!("✅ Control and scan-validation listeners started");
        vec![control_handle, validation_handle]
    }
}

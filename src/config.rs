use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

/// Timing parameters of token generation and scan validation.
#[derive(Clone, Debug)]
pub struct QrSettings {
    /// The interval between two mints of the same session.
    pub interval: Duration,
    /// How long a minted token stays in the token store.
    pub token_ttl: Duration,
    /// The window in which another class of the same teacher and module
    /// blocks generation.
    pub cooldown: Duration,
    /// How early before a section starts a scan is accepted.
    pub early_entry: Duration,
    /// The pause before an event bus subscription is re-established.
    pub reconnect_backoff: Duration,
}

impl Default for QrSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            token_ttl: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            early_entry: Duration::from_secs(15 * 60),
            reconnect_backoff: Duration::from_secs(5),
        }
    }
}

/// The application's configuration.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// The URL of the Redis server.
    pub redis_url: String,
    /// The address the HTTP ingress listens on.
    pub bind_addr: SocketAddr,
    /// The pre-shared AES-256 key used to seal tokens.
    pub token_key: Zeroizing<Vec<u8>>,
    /// Token generation and validation timings.
    pub qr: QrSettings,
}

/// Reads an optional numeric variable, falling back to `default`.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid {}", key)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let mut token_key_hex = env::var("TOKEN_KEY")
            .context("TOKEN_KEY must be set (generate with: openssl rand -hex 32)")?;

        let token_key_bytes = hex::decode(&token_key_hex)
            .context("TOKEN_KEY must be valid hexadecimal")?;

        token_key_hex.zeroize();

        if token_key_bytes.len() != 32 {
            anyhow::bail!("TOKEN_KEY must be exactly 32 bytes (64 hex characters)");
        }

        let defaults = QrSettings::default();
        let qr = QrSettings {
            interval: Duration::from_secs(env_or("QR_INTERVAL_SECS", defaults.interval.as_secs())?),
            token_ttl: Duration::from_secs(env_or("QR_TOKEN_TTL_SECS", defaults.token_ttl.as_secs())?),
            cooldown: Duration::from_secs(env_or("QR_COOLDOWN_SECS", defaults.cooldown.as_secs())?),
            early_entry: Duration::from_secs(
                env_or("QR_EARLY_ENTRY_MINUTES", defaults.early_entry.as_secs() / 60)? * 60,
            ),
            reconnect_backoff: Duration::from_secs(
                env_or("BUS_RECONNECT_SECS", defaults.reconnect_backoff.as_secs())?,
            ),
        };

        if qr.interval.is_zero() || qr.token_ttl.is_zero() {
            anyhow::bail!("QR_INTERVAL_SECS and QR_TOKEN_TTL_SECS must be greater than zero");
        }

        if qr.token_ttl < qr.interval {
            tracing::warn!(
                "⚠️  QR_TOKEN_TTL_SECS ({}s) is shorter than QR_INTERVAL_SECS ({}s); classes will have gaps without a valid token",
                qr.token_ttl.as_secs(),
                qr.interval.as_secs()
            );
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL must be set")?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            bind_addr: env_or("BIND_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?,
            token_key: Zeroizing::new(token_key_bytes),
            qr,
        })
    }
}

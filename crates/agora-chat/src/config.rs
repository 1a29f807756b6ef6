//! Service configuration loaded from environment variables.
//!
//! Everything has a default so the service starts with zero configuration.
//! Cryptographic parameters are constants in `agora_shared::constants` and
//! deliberately absent here.

use std::path::PathBuf;
use std::time::Duration;

use agora_store::database::DEFAULT_BUSY_TIMEOUT;
use agora_store::segments::DEFAULT_APPEND_RETRIES;

/// Upper bound for `AGORA_APPEND_RETRIES`.
pub const MAX_APPEND_RETRIES: u32 = 5;

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// SQLite database file.
    /// Env: `AGORA_DB_PATH`
    /// Default: `None`, meaning the platform data directory + `agora.db`.
    pub db_path: Option<PathBuf>,

    /// How long a writer waits on a locked database.
    /// Env: `AGORA_BUSY_TIMEOUT_MS`
    /// Default: 5000 ms
    pub busy_timeout: Duration,

    /// Re-read-and-reapply attempts when a segment changed underneath an
    /// append.
    /// Env: `AGORA_APPEND_RETRIES`
    /// Default: 1, capped at [`MAX_APPEND_RETRIES`]
    pub append_retries: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            append_retries: DEFAULT_APPEND_RETRIES,
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = get("AGORA_DB_PATH") {
            if !path.trim().is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(val) = get("AGORA_BUSY_TIMEOUT_MS") {
            match val.trim().parse::<u64>() {
                Ok(ms) => config.busy_timeout = Duration::from_millis(ms),
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid AGORA_BUSY_TIMEOUT_MS, using default");
                }
            }
        }

        if let Some(val) = get("AGORA_APPEND_RETRIES") {
            match val.trim().parse::<u32>() {
                Ok(n) if n > MAX_APPEND_RETRIES => {
                    tracing::warn!(
                        value = n,
                        max = MAX_APPEND_RETRIES,
                        "AGORA_APPEND_RETRIES capped"
                    );
                    config.append_retries = MAX_APPEND_RETRIES;
                }
                Ok(n) => config.append_retries = n,
                Err(_) => {
                    tracing::warn!(value = %val, "Invalid AGORA_APPEND_RETRIES, using default");
                }
            }
        }

        config
    }
}

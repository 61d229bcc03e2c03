use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Hard lifetime of an unconfirmed lock.
    pub lock_ttl: Duration,
    /// Soft deadline after which an unconfirmed hold is proactively
    /// released. Clamped to `lock_ttl`.
    pub confirm_window: Duration,
    /// Backing store selector. Only "memory" is supported.
    pub store_endpoint: String,
    /// Hex digest the first ledger entry chains from.
    pub ledger_genesis_hash: String,
}

pub const DEFAULT_GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let lock_ttl = Duration::from_secs(env_or("LOCK_TTL_SECONDS", 300));
        let confirm_window =
            Duration::from_secs(env_or("CONFIRM_WINDOW_SECONDS", lock_ttl.as_secs()))
                .min(lock_ttl);
        Self {
            bind: std::env::var("SLOTLOCK_BIND").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("SLOTLOCK_PORT", 8080),
            data_dir: PathBuf::from(
                std::env::var("SLOTLOCK_DATA_DIR").unwrap_or_else(|_| "./data".into()),
            ),
            metrics_port: std::env::var("SLOTLOCK_METRICS_PORT")
                .ok()
                .and_then(|s| s.parse().ok()),
            lock_ttl,
            confirm_window,
            store_endpoint: std::env::var("STORE_ENDPOINT").unwrap_or_else(|_| "memory".into()),
            ledger_genesis_hash: std::env::var("LEDGER_GENESIS_HASH")
                .unwrap_or_else(|_| DEFAULT_GENESIS_HASH.into()),
        }
    }
}

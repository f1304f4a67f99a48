//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

/// Volume reported by agents that have no playable media yet
pub const DEFAULT_VOLUME: f64 = 0.5;

/// Errors raised while reading configuration overrides
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("HOME is not set and DUCKING_DATA_DIR was not given")]
    NoHome,

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,

    /// File holding the persisted protection state
    pub state_path: PathBuf,

    pub coordinator: CoordinatorSettings,
}

/// Tunables of the ducking coordinator
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Activity monitor tick period
    pub poll_interval: Duration,
    /// Bound on every single agent query
    pub query_timeout: Duration,
    /// Ducked volume = original volume * duck_factor
    pub duck_factor: f64,
    /// How long a protected source loaded from disk may take to reconnect
    pub startup_grace: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(400),
            query_timeout: Duration::from_millis(250),
            duck_factor: 0.1,
            startup_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Configuration rooted at `data_dir`, ignoring the environment
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            socket_path: data_dir.join("daemon.sock"),
            state_path: data_dir.join("state.json"),
            data_dir,
            coordinator: CoordinatorSettings::default(),
        }
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = match lookup("DUCKING_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => {
                let home = lookup("HOME").ok_or(ConfigError::NoHome)?;
                PathBuf::from(home)
                    .join(".local")
                    .join("share")
                    .join("ducking-daemon")
            }
        };

        let mut config = Self::with_data_dir(data_dir);

        if let Some(socket) = lookup("DUCKING_SOCKET") {
            config.socket_path = PathBuf::from(socket);
        }
        if let Some(ms) = parse_millis(&lookup, "DUCKING_POLL_INTERVAL_MS")? {
            config.coordinator.poll_interval = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "DUCKING_QUERY_TIMEOUT_MS")? {
            config.coordinator.query_timeout = ms;
        }
        if let Some(ms) = parse_millis(&lookup, "DUCKING_STARTUP_GRACE_MS")? {
            config.coordinator.startup_grace = ms;
        }
        if let Some(raw) = lookup("DUCKING_DUCK_FACTOR") {
            config.coordinator.duck_factor = raw
                .parse::<f64>()
                .ok()
                .filter(|factor| (0.0..=1.0).contains(factor))
                .ok_or(ConfigError::InvalidValue {
                    key: "DUCKING_DUCK_FACTOR",
                    value: raw,
                })?;
        }

        Ok(config)
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
        _ => Err(ConfigError::InvalidValue { key, value: raw }),
    }
}

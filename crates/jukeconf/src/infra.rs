//! Infrastructure configuration - things that cannot change at runtime.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// HTTP server binding and CORS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP + WebSocket listen port.
    /// Default: 5175 (env: `API_PORT`)
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,

    /// Origins allowed by the CORS layer. Empty list allows none beyond
    /// same-origin. (env: `ALLOWED_ORIGINS`, CSV)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl ServerConfig {
    fn default_port() -> u16 {
        5175
    }

    pub fn bind_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

/// Filesystem paths for Jukejoint state and media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for runtime state (sqlite database).
    /// Default: ~/.local/share/jukejoint
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory for saved audio artifacts and cover images.
    /// Default: `<state_dir>/media`
    #[serde(default)]
    pub media_dir: Option<PathBuf>,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/jukejoint"))
            .unwrap_or_else(|| PathBuf::from(".local/share/jukejoint"))
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("jukejoint.db")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.media_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("media"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            media_dir: None,
        }
    }
}

/// Logging thresholds and toggles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter when `RUST_LOG` is unset.
    /// Default: "info"
    #[serde(default = "LoggingConfig::default_log_level")]
    pub log_level: String,

    /// Requests slower than this are logged at warn.
    /// Default: 1500 (env: `REQUEST_LOG_SLOW_MS`)
    #[serde(default = "LoggingConfig::default_slow_request_ms")]
    pub slow_request_ms: u64,

    /// Interval between noisy-route summary flushes.
    /// Default: 30000 (env: `REQUEST_LOG_SUMMARY_INTERVAL_MS`)
    #[serde(default = "LoggingConfig::default_summary_interval_ms")]
    pub summary_interval_ms: u64,

    /// Per-emit event-bus tracing.
    /// Default: false (env: `LOG_EVENT_BUS`, truthy)
    #[serde(default)]
    pub event_bus_trace: bool,

    /// Bus handlers slower than this are logged at warn.
    /// Default: 200 (env: `LOG_EVENT_HANDLER_SLOW_MS`)
    #[serde(default = "LoggingConfig::default_handler_slow_ms")]
    pub handler_slow_ms: u64,
}

impl LoggingConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_slow_request_ms() -> u64 {
        1500
    }

    fn default_summary_interval_ms() -> u64 {
        30_000
    }

    fn default_handler_slow_ms() -> u64 {
        200
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            slow_request_ms: Self::default_slow_request_ms(),
            summary_interval_ms: Self::default_summary_interval_ms(),
            event_bus_trace: false,
            handler_slow_ms: Self::default_handler_slow_ms(),
        }
    }
}

/// Background maintenance intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Interval between sweeps of expired temporary playlists.
    /// Default: 900000 (env: `TEMP_PLAYLIST_CLEANUP_INTERVAL_MS`)
    #[serde(default = "CleanupConfig::default_temp_playlist_interval_ms")]
    pub temp_playlist_interval_ms: u64,
}

impl CleanupConfig {
    fn default_temp_playlist_interval_ms() -> u64 {
        900_000
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            temp_playlist_interval_ms: Self::default_temp_playlist_interval_ms(),
        }
    }
}

/// Infrastructure half of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InfraConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

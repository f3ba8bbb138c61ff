//! Minimal configuration loading for Jukejoint.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): things that cannot change at
//!   runtime - bind address, filesystem paths, logging thresholds.
//!
//! - **Bootstrap** (`BootstrapConfig`): initial values that seed runtime
//!   state - model endpoint URLs, per-endpoint concurrency, pipeline
//!   tunables. After startup, the runtime is the source of truth.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/jukejoint/config.toml` (system)
//! 2. `~/.config/jukejoint/config.toml` (user)
//! 3. `./jukejoint.toml` (local override, or `--config` path)
//! 4. Environment variables
//!
//! # Recognized environment variables
//!
//! | Variable | Default | Effect |
//! |---|---|---|
//! | `API_PORT` | 5175 | HTTP + WebSocket listen port |
//! | `ALLOWED_ORIGINS` | (empty) | CSV of origins allowed by CORS |
//! | `REQUEST_LOG_SLOW_MS` | 1500 | Requests slower than this are warned |
//! | `REQUEST_LOG_SUMMARY_INTERVAL_MS` | 30000 | Noisy-route summary flush interval |
//! | `TEMP_PLAYLIST_CLEANUP_INTERVAL_MS` | 900000 | Expired temp-playlist sweep interval |
//! | `LOG_EVENT_BUS` | (unset) | Truthy enables per-emit bus tracing |
//! | `LOG_EVENT_HANDLER_SLOW_MS` | 200 | Bus handlers slower than this are warned |
//! | `JUKEJOINT_STATE_DIR` | `~/.local/share/jukejoint` | State directory (sqlite db) |
//! | `JUKEJOINT_MEDIA_DIR` | `<state_dir>/media` | Saved audio / cover directory |
//! | `JUKEJOINT_MODEL_<NAME>` | see `[models]` | Model endpoint base URL override |
//! | `RUST_LOG` | `info` | Log filter |
//!
//! # Example Config
//!
//! ```toml
//! [server]
//! port = 5175
//! allowed_origins = ["http://localhost:5173"]
//!
//! [models]
//! llm = "http://127.0.0.1:2100"
//! image = "http://127.0.0.1:2200"
//! audio = "http://127.0.0.1:2300"
//! audio_concurrency = 2
//!
//! [pipeline]
//! poll_interval_ms = 5000
//! poll_max_attempts = 120
//! ```

pub mod bootstrap;
pub mod infra;
pub mod loader;

pub use bootstrap::{BootstrapConfig, ModelsConfig, PipelineConfig};
pub use infra::{CleanupConfig, InfraConfig, LoggingConfig, PathsConfig, ServerConfig};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete Jukejoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JukeConfig {
    /// Infrastructure - cannot change at runtime.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Bootstrap - seeds runtime state.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

impl JukeConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/jukejoint/config.toml`
    /// 3. `~/.config/jukejoint/config.toml`
    /// 4. `./jukejoint.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, optionally from a specific file path, and report
    /// which files and environment variables contributed.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = JukeConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let overlay = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, overlay);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }

    /// Render the effective configuration as TOML (for `--show-config`).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_else(|e| format!("# serialization error: {e}"))
    }
}

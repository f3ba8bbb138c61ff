//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, JukeConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    // System config
    let system = PathBuf::from("/etc/jukejoint/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("jukejoint/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    // Local override (current directory)
    let local = PathBuf::from("jukejoint.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<JukeConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from a TOML string.
fn parse_toml(contents: &str, path: &Path) -> Result<JukeConfig, ConfigError> {
    toml::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge two configs, with `overlay` taking precedence for every value the
/// overlay file set explicitly.
///
/// Serde already fills unset fields with defaults, so the merge compares
/// against defaults field-group-wise: a section identical to its default is
/// treated as "not set" and the base value survives.
pub fn merge_configs(base: JukeConfig, overlay: JukeConfig) -> JukeConfig {
    fn pick<T: PartialEq>(base: T, overlay: T, default: T) -> T {
        if overlay != default {
            overlay
        } else {
            base
        }
    }

    let d = JukeConfig::default();
    JukeConfig {
        infra: crate::InfraConfig {
            server: crate::ServerConfig {
                port: pick(
                    base.infra.server.port,
                    overlay.infra.server.port,
                    d.infra.server.port,
                ),
                allowed_origins: pick(
                    base.infra.server.allowed_origins,
                    overlay.infra.server.allowed_origins,
                    d.infra.server.allowed_origins,
                ),
            },
            paths: crate::PathsConfig {
                state_dir: pick(
                    base.infra.paths.state_dir,
                    overlay.infra.paths.state_dir,
                    d.infra.paths.state_dir,
                ),
                media_dir: pick(
                    base.infra.paths.media_dir,
                    overlay.infra.paths.media_dir,
                    d.infra.paths.media_dir,
                ),
            },
            logging: crate::LoggingConfig {
                log_level: pick(
                    base.infra.logging.log_level,
                    overlay.infra.logging.log_level,
                    d.infra.logging.log_level,
                ),
                slow_request_ms: pick(
                    base.infra.logging.slow_request_ms,
                    overlay.infra.logging.slow_request_ms,
                    d.infra.logging.slow_request_ms,
                ),
                summary_interval_ms: pick(
                    base.infra.logging.summary_interval_ms,
                    overlay.infra.logging.summary_interval_ms,
                    d.infra.logging.summary_interval_ms,
                ),
                event_bus_trace: pick(
                    base.infra.logging.event_bus_trace,
                    overlay.infra.logging.event_bus_trace,
                    d.infra.logging.event_bus_trace,
                ),
                handler_slow_ms: pick(
                    base.infra.logging.handler_slow_ms,
                    overlay.infra.logging.handler_slow_ms,
                    d.infra.logging.handler_slow_ms,
                ),
            },
            cleanup: crate::infra::CleanupConfig {
                temp_playlist_interval_ms: pick(
                    base.infra.cleanup.temp_playlist_interval_ms,
                    overlay.infra.cleanup.temp_playlist_interval_ms,
                    d.infra.cleanup.temp_playlist_interval_ms,
                ),
            },
        },
        bootstrap: crate::BootstrapConfig {
            models: crate::ModelsConfig {
                llm: pick(
                    base.bootstrap.models.llm,
                    overlay.bootstrap.models.llm,
                    d.bootstrap.models.llm,
                ),
                image: pick(
                    base.bootstrap.models.image,
                    overlay.bootstrap.models.image,
                    d.bootstrap.models.image,
                ),
                audio: pick(
                    base.bootstrap.models.audio,
                    overlay.bootstrap.models.audio,
                    d.bootstrap.models.audio,
                ),
                llm_concurrency: pick(
                    base.bootstrap.models.llm_concurrency,
                    overlay.bootstrap.models.llm_concurrency,
                    d.bootstrap.models.llm_concurrency,
                ),
                image_concurrency: pick(
                    base.bootstrap.models.image_concurrency,
                    overlay.bootstrap.models.image_concurrency,
                    d.bootstrap.models.image_concurrency,
                ),
                audio_concurrency: pick(
                    base.bootstrap.models.audio_concurrency,
                    overlay.bootstrap.models.audio_concurrency,
                    d.bootstrap.models.audio_concurrency,
                ),
            },
            pipeline: crate::PipelineConfig {
                poll_interval_ms: pick(
                    base.bootstrap.pipeline.poll_interval_ms,
                    overlay.bootstrap.pipeline.poll_interval_ms,
                    d.bootstrap.pipeline.poll_interval_ms,
                ),
                poll_max_attempts: pick(
                    base.bootstrap.pipeline.poll_max_attempts,
                    overlay.bootstrap.pipeline.poll_max_attempts,
                    d.bootstrap.pipeline.poll_max_attempts,
                ),
            },
        },
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut JukeConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("API_PORT") {
        if let Ok(port) = v.parse() {
            config.infra.server.port = port;
            sources.env_overrides.push("API_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("ALLOWED_ORIGINS") {
        config.infra.server.allowed_origins = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        sources.env_overrides.push("ALLOWED_ORIGINS".to_string());
    }

    if let Ok(v) = env::var("REQUEST_LOG_SLOW_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.logging.slow_request_ms = ms;
            sources.env_overrides.push("REQUEST_LOG_SLOW_MS".to_string());
        }
    }
    if let Ok(v) = env::var("REQUEST_LOG_SUMMARY_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.logging.summary_interval_ms = ms;
            sources
                .env_overrides
                .push("REQUEST_LOG_SUMMARY_INTERVAL_MS".to_string());
        }
    }
    if let Ok(v) = env::var("TEMP_PLAYLIST_CLEANUP_INTERVAL_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.cleanup.temp_playlist_interval_ms = ms;
            sources
                .env_overrides
                .push("TEMP_PLAYLIST_CLEANUP_INTERVAL_MS".to_string());
        }
    }
    if let Ok(v) = env::var("LOG_EVENT_BUS") {
        config.infra.logging.event_bus_trace = is_truthy(&v);
        sources.env_overrides.push("LOG_EVENT_BUS".to_string());
    }
    if let Ok(v) = env::var("LOG_EVENT_HANDLER_SLOW_MS") {
        if let Ok(ms) = v.parse() {
            config.infra.logging.handler_slow_ms = ms;
            sources
                .env_overrides
                .push("LOG_EVENT_HANDLER_SLOW_MS".to_string());
        }
    }

    if let Ok(v) = env::var("JUKEJOINT_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
        sources.env_overrides.push("JUKEJOINT_STATE_DIR".to_string());
    }
    if let Ok(v) = env::var("JUKEJOINT_MEDIA_DIR") {
        config.infra.paths.media_dir = Some(expand_path(&v));
        sources.env_overrides.push("JUKEJOINT_MEDIA_DIR".to_string());
    }

    if let Ok(v) = env::var("RUST_LOG") {
        config.infra.logging.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    // Model endpoints (JUKEJOINT_MODEL_<NAME>)
    if let Ok(v) = env::var("JUKEJOINT_MODEL_LLM") {
        config.bootstrap.models.llm = v;
        sources.env_overrides.push("JUKEJOINT_MODEL_LLM".to_string());
    }
    if let Ok(v) = env::var("JUKEJOINT_MODEL_IMAGE") {
        config.bootstrap.models.image = v;
        sources.env_overrides.push("JUKEJOINT_MODEL_IMAGE".to_string());
    }
    if let Ok(v) = env::var("JUKEJOINT_MODEL_AUDIO") {
        config.bootstrap.models.audio = v;
        sources.env_overrides.push("JUKEJOINT_MODEL_AUDIO".to_string());
    }
}

/// Truthy parse for flag-style variables: 1/true/yes/on.
fn is_truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Expand ~ in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

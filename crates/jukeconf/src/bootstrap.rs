//! Bootstrap configuration - initial values that seed runtime state.

use serde::{Deserialize, Serialize};

/// Model endpoint base URLs and per-endpoint concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Text LLM endpoint (song metadata generation).
    /// Default: http://127.0.0.1:2100 (env: `JUKEJOINT_MODEL_LLM`)
    #[serde(default = "ModelsConfig::default_llm")]
    pub llm: String,

    /// Cover image endpoint.
    /// Default: http://127.0.0.1:2200 (env: `JUKEJOINT_MODEL_IMAGE`)
    #[serde(default = "ModelsConfig::default_image")]
    pub image: String,

    /// Audio (ACE) endpoint.
    /// Default: http://127.0.0.1:2300 (env: `JUKEJOINT_MODEL_AUDIO`)
    #[serde(default = "ModelsConfig::default_audio")]
    pub audio: String,

    /// Maximum concurrent LLM jobs. Default: 2
    #[serde(default = "ModelsConfig::default_llm_concurrency")]
    pub llm_concurrency: usize,

    /// Maximum concurrent image jobs. Default: 2
    #[serde(default = "ModelsConfig::default_image_concurrency")]
    pub image_concurrency: usize,

    /// Maximum concurrent audio jobs (submissions and poll probes share
    /// these slots). Default: 2
    #[serde(default = "ModelsConfig::default_audio_concurrency")]
    pub audio_concurrency: usize,
}

impl ModelsConfig {
    fn default_llm() -> String {
        "http://127.0.0.1:2100".to_string()
    }

    fn default_image() -> String {
        "http://127.0.0.1:2200".to_string()
    }

    fn default_audio() -> String {
        "http://127.0.0.1:2300".to_string()
    }

    fn default_llm_concurrency() -> usize {
        2
    }

    fn default_image_concurrency() -> usize {
        2
    }

    fn default_audio_concurrency() -> usize {
        2
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            llm: Self::default_llm(),
            image: Self::default_image(),
            audio: Self::default_audio(),
            llm_concurrency: Self::default_llm_concurrency(),
            image_concurrency: Self::default_image_concurrency(),
            audio_concurrency: Self::default_audio_concurrency(),
        }
    }
}

/// Generation pipeline tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Delay between audio status probes. Default: 5000
    #[serde(default = "PipelineConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum audio status probes before the song errors out.
    /// Default: 120 (~10 minutes at the default interval)
    #[serde(default = "PipelineConfig::default_poll_max_attempts")]
    pub poll_max_attempts: u32,
}

impl PipelineConfig {
    fn default_poll_interval_ms() -> u64 {
        5000
    }

    fn default_poll_max_attempts() -> u32 {
        120
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: Self::default_poll_interval_ms(),
            poll_max_attempts: Self::default_poll_max_attempts(),
        }
    }
}

/// Bootstrap half of the configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

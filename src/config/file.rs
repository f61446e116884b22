//! TOML configuration file loading
//!
//! Supports `~/.config/murmur/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct MurmurConfigFile {
    /// Data directory override
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Session memory configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Segmentation configuration
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Transcription engine
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Response generator
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis engine
    #[serde(default)]
    pub tts: TtsFileConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub port: Option<u16>,
    pub api_key: Option<String>,
    pub rate_limit_per_minute: Option<u32>,
    pub utterance_queue: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Idle seconds before a session expires
    pub timeout_secs: Option<u64>,
    pub reap_interval_secs: Option<u64>,
    pub max_history: Option<usize>,
    pub context_max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_ms: Option<u32>,
    pub voice_threshold: Option<f32>,
    pub trigger_voiced_frames: Option<u32>,
    pub end_silence_ms: Option<u32>,
    pub max_utterance_ms: Option<u32>,
    pub min_utterance_sec: Option<f32>,
    pub min_rms: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub concurrency: Option<usize>,
    pub max_queue: Option<usize>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub timeout_secs: Option<u64>,
    pub retries: Option<u32>,
    pub fallback_text: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f64>,
    pub api_key: Option<String>,
    pub chunk_size: Option<usize>,
    pub concurrency: Option<usize>,
    pub max_queue: Option<usize>,
    pub cache_entries: Option<usize>,
    /// Seconds without audio before a synthesis is abandoned
    pub timeout_secs: Option<u64>,
}

/// Return the default config file path
///
/// Uses `~/.config/murmur/config.toml` on Linux
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "murmur", "murmur")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn load_file(path: &Path) -> Result<MurmurConfigFile> {
    let contents = std::fs::read_to_string(path)?;
    let parsed: MurmurConfigFile = toml::from_str(&contents)?;
    tracing::debug!(path = %path.display(), "loaded config file");
    Ok(parsed)
}

/// Parse the default config file if it exists
///
/// # Errors
///
/// Returns error if the file exists but cannot be parsed
pub fn load_default() -> Result<Option<MurmurConfigFile>> {
    let Some(path) = config_file_path() else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    load_file(&path).map(Some)
}

//! Configuration management for the Murmur gateway
//!
//! Layering order: built-in defaults, then the TOML file (see [`file`]),
//! then environment variables. CLI flags are applied last by the binary.

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;

use crate::{Error, Result};

/// Gateway configuration
#[derive(Debug, Default)]
pub struct Config {
    /// Path to data directory (session database)
    pub data_dir: PathBuf,

    /// HTTP/WebSocket server configuration
    pub server: ServerConfig,

    /// Session memory configuration
    pub session: SessionConfig,

    /// Utterance segmentation configuration
    pub vad: VadConfig,

    /// Transcription engine configuration
    pub stt: SttConfig,

    /// Response generator configuration
    pub llm: LlmConfig,

    /// Speech synthesis configuration
    pub tts: TtsConfig,
}

/// HTTP/WebSocket server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// API key for destructive endpoints (from `MURMUR_API_KEY` env)
    pub api_key: Option<String>,

    /// Requests per minute for the inspection API (0 disables limiting)
    pub rate_limit_per_minute: u32,

    /// Utterances allowed in flight per connection before audio intake pauses
    pub utterance_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 18790,
            api_key: None,
            rate_limit_per_minute: 0,
            utterance_queue: 2,
        }
    }
}

/// Session memory configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Idle time after which the reaper expires a session
    pub timeout: Duration,

    /// How often the reaper sweeps the active map
    pub reap_interval: Duration,

    /// Maximum turns kept per session (oldest evicted first)
    pub max_history: usize,

    /// Character budget for the context sent to the response generator
    pub context_max_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1200),
            reap_interval: Duration::from_secs(300),
            max_history: 50,
            context_max_chars: 1000,
        }
    }
}

/// Voice activity detection and segmentation configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Input sample rate in Hz (mono, 16-bit PCM)
    pub sample_rate: u32,

    /// Analysis frame length in milliseconds
    pub frame_ms: u32,

    /// Frame RMS above which a frame counts as voiced
    pub voice_threshold: f32,

    /// Consecutive voiced frames required to open an utterance
    pub trigger_voiced_frames: u32,

    /// Trailing silence that closes an utterance
    pub end_silence_ms: u32,

    /// Hard cap on utterance length
    pub max_utterance_ms: u32,

    /// Utterances shorter than this are discarded as noise
    pub min_utterance_sec: f32,

    /// Utterances whose peak frame RMS stays below this are discarded
    pub min_rms: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_ms: 20,
            voice_threshold: 0.01,
            trigger_voiced_frames: 2,
            end_silence_ms: 250,
            max_utterance_ms: 7000,
            min_utterance_sec: 0.25,
            min_rms: 0.006,
        }
    }
}

impl VadConfig {
    /// Number of samples in one analysis frame
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

/// Transcription engine configuration
#[derive(Debug)]
pub struct SttConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,

    /// Model identifier (e.g. "whisper-1")
    pub model: String,

    /// Bearer token for the engine
    pub api_key: Option<SecretString>,

    /// Global number of concurrent transcriptions
    pub concurrency: usize,

    /// Requests allowed to wait before the oldest is rejected
    pub max_queue: usize,

    /// Per-request deadline
    pub timeout: Duration,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            api_key: None,
            concurrency: 2,
            max_queue: 16,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Response generator configuration
#[derive(Debug)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Bearer token for the generator
    pub api_key: Option<SecretString>,

    /// System prompt prepended to every request
    pub system_prompt: String,

    /// Per-attempt deadline
    pub timeout: Duration,

    /// Retries after the first attempt
    pub retries: u32,

    /// Spoken when every attempt fails
    pub fallback_text: String,

    /// Maximum tokens for a reply
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            system_prompt: "You are a friendly voice assistant. Keep replies short and \
                            conversational; they will be spoken aloud."
                .to_string(),
            timeout: Duration::from_secs(10),
            retries: 1,
            fallback_text: "Sorry, I'm having trouble thinking right now. Could you say that again?"
                .to_string(),
            max_tokens: 300,
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug)]
pub struct TtsConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,

    /// Model identifier (e.g. "tts-1")
    pub model: String,

    /// Default voice when the session has no preference
    pub voice: String,

    /// Speed multiplier (0.25 to 4.0)
    pub speed: f64,

    /// Bearer token for the engine
    pub api_key: Option<SecretString>,

    /// Bytes per streamed audio chunk
    pub chunk_size: usize,

    /// Global number of concurrent syntheses
    pub concurrency: usize,

    /// Requests allowed to wait before the oldest is rejected
    pub max_queue: usize,

    /// Cached syntheses kept in memory (0 disables the cache)
    pub cache_entries: usize,

    /// Longest wait for the engine's next piece of audio
    pub timeout: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            api_key: None,
            chunk_size: 16 * 1024,
            concurrency: 2,
            max_queue: 16,
            cache_entries: 64,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Default location of the data directory
///
/// Uses `~/.local/share/murmur/` on Linux
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "murmur", "murmur")
        .map_or_else(|| PathBuf::from(".murmur"), |d| d.data_dir().to_path_buf())
}

impl Config {
    /// Load configuration from defaults, the TOML file and the environment
    ///
    /// When `path` is `None` the default config file location is used if it
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns error if the config file cannot be parsed or values are invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self {
            data_dir: default_data_dir(),
            ..Self::default()
        };

        let file_config = match path {
            Some(p) => Some(file::load_file(p)?),
            None => file::load_default()?,
        };
        if let Some(fc) = file_config {
            config.apply_file(fc);
        }

        config.apply_env();
        config.validate()?;

        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            tracing::warn!(
                path = %config.data_dir.display(),
                error = %e,
                "failed to create data directory"
            );
        }

        Ok(config)
    }

    /// Overlay values from a parsed config file
    pub fn apply_file(&mut self, fc: file::MurmurConfigFile) {
        if let Some(dir) = fc.data_dir {
            self.data_dir = dir;
        }

        let s = fc.server;
        set(&mut self.server.port, s.port);
        if s.api_key.is_some() {
            self.server.api_key = s.api_key;
        }
        set(&mut self.server.rate_limit_per_minute, s.rate_limit_per_minute);
        set(&mut self.server.utterance_queue, s.utterance_queue);

        let s = fc.session;
        if let Some(secs) = s.timeout_secs {
            self.session.timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = s.reap_interval_secs {
            self.session.reap_interval = Duration::from_secs(secs);
        }
        set(&mut self.session.max_history, s.max_history);
        set(&mut self.session.context_max_chars, s.context_max_chars);

        let v = fc.vad;
        set(&mut self.vad.sample_rate, v.sample_rate);
        set(&mut self.vad.frame_ms, v.frame_ms);
        set(&mut self.vad.voice_threshold, v.voice_threshold);
        set(&mut self.vad.trigger_voiced_frames, v.trigger_voiced_frames);
        set(&mut self.vad.end_silence_ms, v.end_silence_ms);
        set(&mut self.vad.max_utterance_ms, v.max_utterance_ms);
        set(&mut self.vad.min_utterance_sec, v.min_utterance_sec);
        set(&mut self.vad.min_rms, v.min_rms);

        let s = fc.stt;
        set(&mut self.stt.base_url, s.base_url);
        set(&mut self.stt.model, s.model);
        if let Some(key) = s.api_key {
            self.stt.api_key = Some(SecretString::from(key));
        }
        set(&mut self.stt.concurrency, s.concurrency);
        set(&mut self.stt.max_queue, s.max_queue);
        if let Some(secs) = s.timeout_secs {
            self.stt.timeout = Duration::from_secs(secs);
        }

        let l = fc.llm;
        set(&mut self.llm.base_url, l.base_url);
        set(&mut self.llm.model, l.model);
        if let Some(key) = l.api_key {
            self.llm.api_key = Some(SecretString::from(key));
        }
        set(&mut self.llm.system_prompt, l.system_prompt);
        if let Some(secs) = l.timeout_secs {
            self.llm.timeout = Duration::from_secs(secs);
        }
        set(&mut self.llm.retries, l.retries);
        set(&mut self.llm.fallback_text, l.fallback_text);
        set(&mut self.llm.max_tokens, l.max_tokens);

        let t = fc.tts;
        set(&mut self.tts.base_url, t.base_url);
        set(&mut self.tts.model, t.model);
        set(&mut self.tts.voice, t.voice);
        set(&mut self.tts.speed, t.speed);
        if let Some(key) = t.api_key {
            self.tts.api_key = Some(SecretString::from(key));
        }
        set(&mut self.tts.chunk_size, t.chunk_size);
        set(&mut self.tts.concurrency, t.concurrency);
        set(&mut self.tts.max_queue, t.max_queue);
        set(&mut self.tts.cache_entries, t.cache_entries);
        if let Some(secs) = t.timeout_secs {
            self.tts.timeout = Duration::from_secs(secs);
        }
    }

    /// Overlay values from `MURMUR_*` environment variables
    ///
    /// `OPENAI_API_KEY` is used for every engine that has no key of its own.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("MURMUR_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = env_parse("MURMUR_PORT") {
            self.server.port = port;
        }
        if let Ok(key) = std::env::var("MURMUR_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(secs) = env_parse("MURMUR_SESSION_TIMEOUT") {
            self.session.timeout = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("MURMUR_STT_URL") {
            self.stt.base_url = url;
        }
        if let Ok(model) = std::env::var("MURMUR_STT_MODEL") {
            self.stt.model = model;
        }
        if let Ok(url) = std::env::var("MURMUR_LLM_URL") {
            self.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("MURMUR_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Ok(url) = std::env::var("MURMUR_TTS_URL") {
            self.tts.base_url = url;
        }
        if let Ok(voice) = std::env::var("MURMUR_TTS_VOICE") {
            self.tts.voice = voice;
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if self.stt.api_key.is_none() {
                self.stt.api_key = Some(SecretString::from(key.clone()));
            }
            if self.llm.api_key.is_none() {
                self.llm.api_key = Some(SecretString::from(key.clone()));
            }
            if self.tts.api_key.is_none() {
                self.tts.api_key = Some(SecretString::from(key));
            }
        }
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error naming the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.vad.frame_samples() == 0 {
            return Err(Error::Config(
                "vad.frame_ms and vad.sample_rate must produce at least one sample".to_string(),
            ));
        }
        if self.vad.trigger_voiced_frames == 0 {
            return Err(Error::Config(
                "vad.trigger_voiced_frames must be at least 1".to_string(),
            ));
        }
        if self.session.max_history == 0 {
            return Err(Error::Config("session.max_history must be at least 1".to_string()));
        }
        if self.stt.concurrency == 0 || self.tts.concurrency == 0 {
            return Err(Error::Config("engine concurrency must be at least 1".to_string()));
        }
        if self.tts.chunk_size == 0 {
            return Err(Error::Config("tts.chunk_size must be positive".to_string()));
        }
        if self.tts.timeout.is_zero() {
            return Err(Error::Config("tts.timeout must be positive".to_string()));
        }
        if self.server.utterance_queue == 0 {
            return Err(Error::Config(
                "server.utterance_queue must be at least 1".to_string(),
            ));
        }
        if !(0.25..=4.0).contains(&self.tts.speed) {
            return Err(Error::Config(format!(
                "tts.speed {} outside 0.25..=4.0",
                self.tts.speed
            )));
        }
        Ok(())
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

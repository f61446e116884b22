//! Error types for the Murmur gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio decoding/encoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

    /// The transcription engine returned no text
    #[error("transcription produced no text")]
    EmptyTranscript,

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Response generator error
    #[error("LLM error: {0}")]
    Llm(String),

    /// A synthesis stream is already in flight for the session
    #[error("session {session_id} already has active stream {stream_id}")]
    StreamActive {
        session_id: String,
        stream_id: String,
    },

    /// No matching synthesis stream
    #[error("no active stream: {0}")]
    StreamNotFound(String),

    /// Work queue is saturated; the request may be retried later
    #[error("overloaded: {0}")]
    Overloaded(String),

    /// Operation exceeded its deadline
    #[error("timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed client message
    #[error("invalid message: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether the caller may retry the same request later
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Overloaded(_) | Self::Timeout(_) => true,
            Self::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().is_some_and(|s| s.is_server_error() || s.as_u16() == 429)
            }
            _ => false,
        }
    }

    /// Short machine-readable code sent to clients
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) | Self::Toml(_) => "config_error",
            Self::Audio(_) => "audio_error",
            Self::Stt(_) | Self::EmptyTranscript => "stt_error",
            Self::Tts(_) => "tts_error",
            Self::Llm(_) => "llm_error",
            Self::StreamActive { .. } => "stream_active",
            Self::StreamNotFound(_) => "stream_not_found",
            Self::Overloaded(_) => "overloaded",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Protocol(_) => "invalid_message",
            Self::Io(_)
            | Self::Http(_)
            | Self::Serialization(_)
            | Self::Database(_)
            | Self::Sqlite(_) => "internal_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_and_timeout_are_retryable() {
        assert!(Error::Overloaded("stt queue full".to_string()).is_retryable());
        assert!(Error::Timeout("llm".to_string()).is_retryable());
        assert!(!Error::EmptyTranscript.is_retryable());
        assert!(!Error::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn stream_active_message_names_both_ids() {
        let err = Error::StreamActive {
            session_id: "s1".to_string(),
            stream_id: "tts-1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("s1"));
        assert!(msg.contains("tts-1"));
        assert_eq!(err.code(), "stream_active");
    }
}

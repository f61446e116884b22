//! Speech-to-text (STT) dispatch
//!
//! The transcription engine is a shared, expensive resource, so every request
//! goes through one global [`AdmissionQueue`] regardless of which session it
//! belongs to.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::admission::{AdmissionQueue, AdmissionStats};
use super::segmenter::UtteranceBuffer;
use crate::config::SttConfig;
use crate::{Error, Result};

/// Text recognized from one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// 0.0 to 1.0; engines that do not report one yield 1.0
    pub confidence: f32,
}

/// External transcription engine
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcript>;
}

/// Response from an OpenAI-compatible `verbose_json` transcription
#[derive(serde::Deserialize)]
struct WhisperResponse {
    text: String,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(serde::Deserialize)]
struct WhisperSegment {
    avg_logprob: f32,
}

impl WhisperResponse {
    /// Mean segment probability, or 1.0 when no segments were reported
    #[allow(clippy::cast_precision_loss)]
    fn confidence(&self) -> f32 {
        if self.segments.is_empty() {
            return 1.0;
        }
        let mean = self.segments.iter().map(|s| s.avg_logprob).sum::<f32>()
            / self.segments.len() as f32;
        mean.exp().clamp(0.0, 1.0)
    }
}

/// Whisper-style HTTP transcription client
pub struct HttpTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
}

impl HttpTranscriber {
    /// Create a client for `{base_url}/audio/transcriptions`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &SttConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/audio/transcriptions",
                config.base_url.trim_end_matches('/')
            ),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_owned())),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<Transcript> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription");

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(wav)
                    .file_name("audio.wav")
                    .mime_str("audio/wav")
                    .map_err(|e| Error::Stt(e.to_string()))?,
            )
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");

        let mut request = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.expose_secret());
        }

        let response = request.send().await.map_err(|e| {
            tracing::error!(error = %e, "transcription request failed");
            e
        })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription API error {status}: {body}")));
        }

        let result: WhisperResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse response");
            e
        })?;

        Ok(Transcript {
            confidence: result.confidence(),
            text: result.text,
        })
    }
}

/// Routes utterances to the shared transcription engine
pub struct TranscriptionDispatcher {
    engine: Arc<dyn Transcriber>,
    queue: AdmissionQueue,
}

impl TranscriptionDispatcher {
    #[must_use]
    pub fn new(engine: Arc<dyn Transcriber>, concurrency: usize, max_queue: usize) -> Self {
        Self {
            engine,
            queue: AdmissionQueue::new("stt", concurrency, max_queue),
        }
    }

    /// Build from config with the HTTP engine
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn from_config(config: &SttConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(HttpTranscriber::new(config)?),
            config.concurrency,
            config.max_queue,
        ))
    }

    /// Transcribe one utterance, waiting for a free engine slot
    ///
    /// The buffer is consumed; nothing is retained after the call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Overloaded`] if the wait queue overflowed,
    /// [`Error::EmptyTranscript`] if the engine heard nothing, or the
    /// engine's own error
    pub async fn submit(&self, session_id: &str, utterance: UtteranceBuffer) -> Result<Transcript> {
        let duration_secs = utterance.duration_secs();
        let wav = utterance.to_wav()?;
        drop(utterance);

        let _permit = self.queue.acquire().await?;
        let started = std::time::Instant::now();
        let transcript = self.engine.transcribe(wav).await?;

        let text = transcript.text.trim();
        if text.is_empty() {
            tracing::debug!(session_id, duration_secs, "empty transcript");
            return Err(Error::EmptyTranscript);
        }

        tracing::info!(
            session_id,
            duration_secs,
            confidence = transcript.confidence,
            elapsed = ?started.elapsed(),
            transcript = %text,
            "transcription complete"
        );

        Ok(Transcript {
            text: text.to_string(),
            confidence: transcript.confidence,
        })
    }

    /// Engine queue occupancy
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        self.queue.stats()
    }
}

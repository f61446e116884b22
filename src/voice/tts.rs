//! Text-to-speech (TTS) engines and the synthesis cache

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use lru::LruCache;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::TtsConfig;
use crate::{Error, Result};

/// Encoded audio, produced incrementally by the engine
pub type AudioStream = BoxStream<'static, Result<Vec<u8>>>;

/// Largest response kept in the synthesis cache
const MAX_CACHED_BYTES: usize = 1024 * 1024;

/// What to say and how
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpeechRequest {
    pub text: String,
    /// Engine voice; `None` uses the configured default
    pub voice: Option<String>,
    pub language: Option<String>,
    /// Reference clip for voice-cloning engines
    pub speaker_ref: Option<String>,
}

impl SpeechRequest {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            voice: None,
            language: None,
            speaker_ref: None,
        }
    }
}

/// External speech synthesis engine
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesis; audio arrives on the returned stream as it is produced
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioStream>;
}

/// OpenAI-compatible `/audio/speech` client with a streamed response body
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<SecretString>,
    model: String,
    voice: String,
    speed: f64,
}

impl HttpSynthesizer {
    /// Create a client for `{base_url}/audio/speech`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(config: &TtsConfig) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .connect_timeout(config.timeout)
                .build()?,
            endpoint: format!("{}/audio/speech", config.base_url.trim_end_matches('/')),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_owned())),
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioStream> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f64,
            response_format: &'a str,
        }

        let body = TtsRequest {
            model: &self.model,
            input: &request.text,
            voice: request.voice.as_deref().unwrap_or(&self.voice),
            speed: self.speed,
            response_format: "mp3",
        };

        let mut http = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key.expose_secret());
        }

        let response = http.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "TTS API error");
            return Err(Error::Tts(format!("TTS API error {status}: {body}")));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(Error::from))
            .boxed())
    }
}

/// Cache hit/miss counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// LRU of complete synthesized responses keyed by request
pub struct SynthesisCache {
    entries: Mutex<LruCache<SpeechRequest, Arc<Vec<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SynthesisCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a request, counting the hit or miss
    pub fn get(&self, request: &SpeechRequest) -> Option<Arc<Vec<u8>>> {
        let found = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(request)
            .cloned();

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    pub fn insert(&self, request: SpeechRequest, audio: Vec<u8>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(request, Arc::new(audio));
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        CacheStats {
            entries: entries.len(),
            capacity: entries.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Serves repeated requests from a [`SynthesisCache`]
///
/// A miss streams straight from the inner engine; the response is stored only
/// once the stream ends cleanly and stayed under [`MAX_CACHED_BYTES`].
pub struct CachingSynthesizer {
    inner: Arc<dyn Synthesizer>,
    cache: Arc<SynthesisCache>,
}

impl CachingSynthesizer {
    #[must_use]
    pub const fn new(inner: Arc<dyn Synthesizer>, cache: Arc<SynthesisCache>) -> Self {
        Self { inner, cache }
    }
}

struct Tee {
    inner: AudioStream,
    collected: Option<Vec<u8>>,
    cache: Arc<SynthesisCache>,
    key: SpeechRequest,
}

#[async_trait]
impl Synthesizer for CachingSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioStream> {
        if let Some(audio) = self.cache.get(request) {
            tracing::debug!(bytes = audio.len(), "synthesis cache hit");
            return Ok(stream::once(async move { Ok::<_, Error>(audio.as_ref().clone()) }).boxed());
        }

        let tee = Tee {
            inner: self.inner.synthesize(request).await?,
            collected: Some(Vec::new()),
            cache: Arc::clone(&self.cache),
            key: request.clone(),
        };

        Ok(stream::unfold(tee, |mut tee| async move {
            match tee.inner.next().await {
                Some(Ok(chunk)) => {
                    if let Some(buf) = tee.collected.as_mut() {
                        if buf.len() + chunk.len() <= MAX_CACHED_BYTES {
                            buf.extend_from_slice(&chunk);
                        } else {
                            tee.collected = None;
                        }
                    }
                    Some((Ok(chunk), tee))
                }
                Some(Err(e)) => {
                    tee.collected = None;
                    Some((Err(e), tee))
                }
                None => {
                    if let Some(buf) = tee.collected.take()
                        && !buf.is_empty()
                    {
                        tee.cache.insert(tee.key.clone(), buf);
                    }
                    None
                }
            }
        })
        .boxed())
    }
}

//! Speech stream dispatcher
//!
//! Streams synthesized audio to a client as ordered, base64-encoded chunks.
//! Each session has at most one stream in flight; the session's
//! `active_stream_id` is the source of truth and is checked and set under the
//! session lock.
//!
//! Every chunk send happens while holding the stream's gate, and cancellation
//! takes the same gate. A send that started before `cancel` therefore
//! completes, and nothing is sent after it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::admission::{AdmissionQueue, AdmissionStats};
use super::tts::{
    CacheStats, CachingSynthesizer, HttpSynthesizer, SpeechRequest, SynthesisCache, Synthesizer,
};
use crate::config::TtsConfig;
use crate::session::SessionStore;
use crate::{Error, Result};

/// Server-to-client notification for one stream
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart {
        stream_id: String,
    },
    AudioChunk {
        stream_id: String,
        chunk_index: u32,
        /// Known only on the final chunk
        total_chunks: Option<u32>,
        /// Base64-encoded audio bytes
        data: String,
        is_final: bool,
    },
    StreamComplete {
        stream_id: String,
        /// Seconds from start to the final chunk
        duration: f64,
        total_chunks: u32,
        total_bytes: usize,
    },
    StreamError {
        stream_id: String,
        reason: String,
    },
}

/// Destination for stream events, usually a connection's outbound channel
#[async_trait]
pub trait StreamSink: Send + Sync {
    /// Deliver an event; `false` means the receiver is gone
    async fn deliver(&self, event: StreamEvent) -> bool;
}

#[async_trait]
impl<T> StreamSink for mpsc::Sender<T>
where
    T: From<StreamEvent> + Send + 'static,
{
    async fn deliver(&self, event: StreamEvent) -> bool {
        self.send(T::from(event)).await.is_ok()
    }
}

/// Terminal state of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Finished(StreamOutcome),
}

/// Guarded by the stream gate
struct Progress {
    phase: Phase,
    next_chunk_index: u32,
    total_bytes: usize,
}

struct StreamState {
    stream_id: String,
    session_id: String,
    gate: tokio::sync::Mutex<Progress>,
    cancel: CancellationToken,
    sink: Arc<dyn StreamSink>,
    started_at: Instant,
}

/// Counters reported by `get_streaming_stats`
#[derive(Debug, Clone, Serialize)]
pub struct StreamingStats {
    pub active_streams: usize,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub queue: AdmissionStats,
    pub cache: Option<CacheStats>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: StreamOutcome) {
        let counter = match outcome {
            StreamOutcome::Completed => &self.completed,
            StreamOutcome::Cancelled => &self.cancelled,
            StreamOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared {
    store: Arc<SessionStore>,
    engine: Arc<dyn Synthesizer>,
    cache: Option<Arc<SynthesisCache>>,
    queue: AdmissionQueue,
    chunk_size: usize,
    /// Longest wait for the engine to start or continue producing audio
    idle_timeout: Duration,
    /// Live streams keyed by session id
    streams: Mutex<HashMap<String, Arc<StreamState>>>,
    counters: Counters,
}

/// Per-session synthesis streaming with cancellation
#[derive(Clone)]
pub struct SpeechStreamDispatcher {
    shared: Arc<Shared>,
}

impl SpeechStreamDispatcher {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        engine: Arc<dyn Synthesizer>,
        chunk_size: usize,
        concurrency: usize,
        max_queue: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                engine,
                cache: None,
                queue: AdmissionQueue::new("tts", concurrency, max_queue),
                chunk_size: chunk_size.max(1),
                idle_timeout,
                streams: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Build from config with the HTTP engine behind the synthesis cache
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn from_config(store: Arc<SessionStore>, config: &TtsConfig) -> Result<Self> {
        let http: Arc<dyn Synthesizer> = Arc::new(HttpSynthesizer::new(config)?);

        let (engine, cache): (Arc<dyn Synthesizer>, _) =
            match NonZeroUsize::new(config.cache_entries) {
                Some(capacity) => {
                    let cache = Arc::new(SynthesisCache::new(capacity));
                    (
                        Arc::new(CachingSynthesizer::new(http, Arc::clone(&cache))),
                        Some(cache),
                    )
                }
                None => (http, None),
            };

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                engine,
                cache,
                queue: AdmissionQueue::new("tts", config.concurrency, config.max_queue),
                chunk_size: config.chunk_size.max(1),
                idle_timeout: config.timeout,
                streams: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        })
    }

    /// Start streaming `request` to `sink`
    ///
    /// The session's stream slot is claimed before this returns; audio is
    /// produced on a background task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamActive`] if the session already has a stream.
    /// The existing stream is left untouched.
    pub async fn start(
        &self,
        session_id: &str,
        stream_id: &str,
        request: SpeechRequest,
        sink: Arc<dyn StreamSink>,
    ) -> Result<tokio::task::JoinHandle<StreamOutcome>> {
        let state = Arc::new(StreamState {
            stream_id: stream_id.to_string(),
            session_id: session_id.to_string(),
            gate: tokio::sync::Mutex::new(Progress {
                phase: Phase::Streaming,
                next_chunk_index: 0,
                total_bytes: 0,
            }),
            cancel: CancellationToken::new(),
            sink,
            started_at: Instant::now(),
        });

        let shared = &self.shared;
        shared
            .store
            .modify(session_id, |session| {
                if let Some(active) = &session.active_stream_id {
                    return Err(Error::StreamActive {
                        session_id: session_id.to_string(),
                        stream_id: active.clone(),
                    });
                }
                session.active_stream_id = Some(stream_id.to_string());
                shared
                    .streams
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(session_id.to_string(), Arc::clone(&state));
                Ok(())
            })
            .await??;

        tracing::info!(
            session_id,
            stream_id,
            text_len = request.text.len(),
            "stream started"
        );

        let shared = Arc::clone(&self.shared);
        Ok(tokio::spawn(async move {
            let outcome = run_stream(&shared, &state, &request).await;
            shared.counters.record(outcome);
            outcome
        }))
    }

    /// Cancel the session's active stream
    ///
    /// A chunk send already in progress completes first; after this returns
    /// no further chunk for the stream is delivered. With `stream_id` set,
    /// only a stream with that id is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamNotFound`] if no matching stream is active
    pub async fn cancel(&self, session_id: &str, stream_id: Option<&str>) -> Result<()> {
        let state = self
            .shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .filter(|s| stream_id.is_none_or(|id| s.stream_id == id))
            .cloned();

        let Some(state) = state else {
            return Err(Error::StreamNotFound(
                stream_id.unwrap_or(session_id).to_string(),
            ));
        };

        let mut progress = state.gate.lock().await;
        if progress.phase != Phase::Streaming {
            return Err(Error::StreamNotFound(state.stream_id.clone()));
        }
        progress.phase = Phase::Finished(StreamOutcome::Cancelled);
        state.cancel.cancel();

        tracing::info!(
            session_id,
            stream_id = %state.stream_id,
            chunks_sent = progress.next_chunk_index,
            "stream cancelled"
        );

        state
            .sink
            .deliver(StreamEvent::StreamError {
                stream_id: state.stream_id.clone(),
                reason: "cancelled".to_string(),
            })
            .await;
        release(&self.shared, &state).await;
        drop(progress);
        Ok(())
    }

    /// Id of the session's in-flight stream, if any
    #[must_use]
    pub fn active_stream(&self, session_id: &str) -> Option<String> {
        self.shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(|s| s.stream_id.clone())
    }

    /// Number of streams in flight across all sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.shared
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn stats(&self) -> StreamingStats {
        let counters = &self.shared.counters;
        StreamingStats {
            active_streams: self.active_count(),
            completed: counters.completed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            queue: self.shared.queue.stats(),
            cache: self.shared.cache.as_ref().map(|c| c.stats()),
        }
    }
}

/// Why chunk production stopped early
enum Halt {
    Cancelled,
    Failed(String),
}

async fn run_stream(shared: &Shared, state: &StreamState, request: &SpeechRequest) -> StreamOutcome {
    if !send_guarded(state, |_| StreamEvent::StreamStart {
        stream_id: state.stream_id.clone(),
    })
    .await
    {
        return finish(shared, state, Halt::Cancelled).await;
    }

    match produce_chunks(shared, state, request).await {
        Ok(()) => complete(shared, state).await,
        Err(halt) => finish(shared, state, halt).await,
    }
}

/// Pull audio from the engine and send it as fixed-size chunks
///
/// One chunk is held back so the last one can be flagged `is_final` with the
/// total count. Only the pending bytes and that one chunk are buffered.
async fn produce_chunks(
    shared: &Shared,
    state: &StreamState,
    request: &SpeechRequest,
) -> std::result::Result<(), Halt> {
    let _permit = tokio::select! {
        () = state.cancel.cancelled() => return Err(Halt::Cancelled),
        permit = shared.queue.acquire() => permit.map_err(|e| Halt::Failed(e.to_string()))?,
    };

    let idle = shared.idle_timeout;
    let stalled = || {
        tracing::warn!(stream_id = %state.stream_id, timeout = ?idle, "synthesis stalled");
        Halt::Failed(format!("no audio from engine within {}s", idle.as_secs_f32()))
    };

    let mut audio = tokio::select! {
        () = state.cancel.cancelled() => return Err(Halt::Cancelled),
        audio = tokio::time::timeout(idle, shared.engine.synthesize(request)) => {
            audio.map_err(|_| stalled())?.map_err(|e| Halt::Failed(e.to_string()))?
        }
    };

    let chunk_size = shared.chunk_size;
    let mut buffer: Vec<u8> = Vec::with_capacity(chunk_size);
    let mut held: Option<Vec<u8>> = None;

    loop {
        let next = tokio::select! {
            () = state.cancel.cancelled() => return Err(Halt::Cancelled),
            next = tokio::time::timeout(idle, audio.next()) => next.map_err(|_| stalled())?,
        };

        match next {
            Some(Ok(bytes)) => {
                buffer.extend_from_slice(&bytes);
                while buffer.len() >= chunk_size {
                    let rest = buffer.split_off(chunk_size);
                    let chunk = std::mem::replace(&mut buffer, rest);
                    if let Some(prev) = held.replace(chunk) {
                        send_chunk(state, prev, false).await?;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::error!(stream_id = %state.stream_id, error = %e, "synthesis failed mid-stream");
                return Err(Halt::Failed(e.to_string()));
            }
            None => break,
        }
    }

    if !buffer.is_empty()
        && let Some(prev) = held.replace(buffer)
    {
        send_chunk(state, prev, false).await?;
    }

    match held {
        Some(last) => send_chunk(state, last, true).await,
        None => Err(Halt::Failed("synthesis produced no audio".to_string())),
    }
}

async fn send_chunk(
    state: &StreamState,
    chunk: Vec<u8>,
    is_final: bool,
) -> std::result::Result<(), Halt> {
    let sent = send_guarded(state, |progress| {
        let chunk_index = progress.next_chunk_index;
        progress.next_chunk_index += 1;
        progress.total_bytes += chunk.len();

        tracing::trace!(stream_id = %state.stream_id, chunk_index, bytes = chunk.len(), is_final, "sending chunk");

        StreamEvent::AudioChunk {
            stream_id: state.stream_id.clone(),
            chunk_index,
            total_chunks: is_final.then_some(chunk_index + 1),
            data: base64::engine::general_purpose::STANDARD.encode(&chunk),
            is_final,
        }
    })
    .await;

    if sent { Ok(()) } else { Err(Halt::Cancelled) }
}

/// Deliver an event while holding the gate, unless the stream has finished
///
/// Returns `false` if the stream was cancelled or the client went away.
async fn send_guarded(
    state: &StreamState,
    build: impl FnOnce(&mut Progress) -> StreamEvent,
) -> bool {
    let mut progress = state.gate.lock().await;
    if progress.phase != Phase::Streaming {
        return false;
    }
    let event = build(&mut progress);
    state.sink.deliver(event).await
}

async fn complete(shared: &Shared, state: &StreamState) -> StreamOutcome {
    let mut progress = state.gate.lock().await;
    if let Phase::Finished(outcome) = progress.phase {
        return outcome;
    }
    progress.phase = Phase::Finished(StreamOutcome::Completed);

    let duration = state.started_at.elapsed().as_secs_f64();
    tracing::info!(
        session_id = %state.session_id,
        stream_id = %state.stream_id,
        chunks = progress.next_chunk_index,
        bytes = progress.total_bytes,
        duration,
        "stream complete"
    );

    state
        .sink
        .deliver(StreamEvent::StreamComplete {
            stream_id: state.stream_id.clone(),
            duration,
            total_chunks: progress.next_chunk_index,
            total_bytes: progress.total_bytes,
        })
        .await;
    release(shared, state).await;
    drop(progress);
    StreamOutcome::Completed
}

async fn finish(shared: &Shared, state: &StreamState, halt: Halt) -> StreamOutcome {
    let mut progress = state.gate.lock().await;

    // Cancelled by `cancel`, which already notified the client and released
    if let Phase::Finished(outcome) = progress.phase {
        return outcome;
    }

    let (outcome, reason) = match halt {
        Halt::Cancelled => (StreamOutcome::Cancelled, "client disconnected".to_string()),
        Halt::Failed(reason) => (StreamOutcome::Failed, reason),
    };
    progress.phase = Phase::Finished(outcome);

    tracing::warn!(
        session_id = %state.session_id,
        stream_id = %state.stream_id,
        reason = %reason,
        "stream ended early"
    );

    state
        .sink
        .deliver(StreamEvent::StreamError {
            stream_id: state.stream_id.clone(),
            reason,
        })
        .await;
    release(shared, state).await;
    drop(progress);
    outcome
}

/// Free the session's stream slot if it still belongs to `state`
///
/// Called with the gate held, so a `cancel` racing a finishing stream
/// returns only once the slot is free. The session is cleared before the
/// stream leaves the live map.
async fn release(shared: &Shared, state: &StreamState) {
    let result = shared
        .store
        .modify(&state.session_id, |session| {
            if session.active_stream_id.as_deref() == Some(state.stream_id.as_str()) {
                session.active_stream_id = None;
            }
        })
        .await;

    if let Err(e) = result {
        tracing::warn!(session_id = %state.session_id, error = %e, "failed to clear active stream");
    }

    let mut streams = shared.streams.lock().unwrap_or_else(PoisonError::into_inner);
    if streams
        .get(&state.session_id)
        .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), state))
    {
        streams.remove(&state.session_id);
    }
}

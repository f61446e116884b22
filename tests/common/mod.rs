//! Shared test utilities: in-memory stores and scripted engines

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use murmur_gateway::agent::{ResponseDispatcher, ResponseGenerator, RetryPolicy};
use murmur_gateway::config::{SessionConfig, VadConfig};
use murmur_gateway::context::{ConversationContext, ConversationManager};
use murmur_gateway::voice::{
    AudioStream, SpeechRequest, SpeechStreamDispatcher, Synthesizer, Transcriber, Transcript,
    TranscriptionDispatcher,
};
use murmur_gateway::{DbPool, Error, Result, SessionRepo, SessionStore, VoiceEngine, db};

pub const FALLBACK_TEXT: &str = "Sorry, could you say that again?";

/// Engine silence tolerated by test speech streams
pub const STREAM_IDLE: Duration = Duration::from_secs(30);

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Session store over a fresh in-memory database
#[must_use]
pub fn setup_test_store() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(SessionRepo::new(setup_test_db())))
}

/// Returns scripted transcripts in order, then "hello"
#[derive(Default)]
pub struct ScriptedTranscriber {
    texts: Mutex<VecDeque<String>>,
    pub calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(texts: &[&str]) -> Self {
        Self {
            texts: Mutex::new(texts.iter().map(|t| (*t).to_string()).collect()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _wav: Vec<u8>) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = self
            .texts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "hello".to_string());
        Ok(Transcript {
            text,
            confidence: 0.9,
        })
    }
}

/// Replies "echo: <user text>" and remembers the context it was given
#[derive(Default)]
pub struct EchoGenerator {
    pub contexts: Mutex<Vec<ConversationContext>>,
}

#[async_trait]
impl ResponseGenerator for EchoGenerator {
    async fn generate(&self, context: &ConversationContext, user_text: &str) -> Result<String> {
        self.contexts.lock().unwrap().push(context.clone());
        Ok(format!("echo: {user_text}"))
    }
}

/// Echoes like [`EchoGenerator`], but each reply waits for a permit
pub struct GatedGenerator {
    gate: tokio::sync::Semaphore,
    pub waiting: AtomicUsize,
}

impl GatedGenerator {
    pub fn new() -> Self {
        Self {
            gate: tokio::sync::Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Let `n` pending or future replies through
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl ResponseGenerator for GatedGenerator {
    async fn generate(&self, _context: &ConversationContext, user_text: &str) -> Result<String> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        Ok(format!("echo: {user_text}"))
    }
}

/// Yields fixed chunks, then optionally never finishes
pub struct ScriptedSynthesizer {
    chunks: Vec<Vec<u8>>,
    hold_open: bool,
    pub calls: AtomicUsize,
    pub requests: Mutex<Vec<SpeechRequest>>,
}

impl ScriptedSynthesizer {
    /// Completes after `chunks`
    pub fn finite(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            hold_open: false,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Yields `chunks`, then stays open until cancelled
    pub fn held_open(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            hold_open: true,
            ..Self::finite(chunks)
        }
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<AudioStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let audio = stream::iter(self.chunks.clone().into_iter().map(Ok));
        if self.hold_open {
            Ok(audio.chain(stream::pending()).boxed())
        } else {
            Ok(audio.boxed())
        }
    }
}

/// Fails before producing audio
pub struct FailingSynthesizer;

#[async_trait]
impl Synthesizer for FailingSynthesizer {
    async fn synthesize(&self, _request: &SpeechRequest) -> Result<AudioStream> {
        Err(Error::Tts("voice model unavailable".to_string()))
    }
}

/// Engine assembled from scripted parts
pub struct TestEngine {
    pub engine: VoiceEngine,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub generator: Arc<EchoGenerator>,
    pub synthesizer: Arc<ScriptedSynthesizer>,
}

/// Build a [`VoiceEngine`] over scripted engines and an in-memory store
#[must_use]
pub fn setup_test_engine(transcripts: &[&str], synthesizer: ScriptedSynthesizer) -> TestEngine {
    let transcriber = Arc::new(ScriptedTranscriber::new(transcripts));
    let generator = Arc::new(EchoGenerator::default());
    let synthesizer = Arc::new(synthesizer);

    let engine = build_engine(transcriber.clone(), generator.clone(), synthesizer.clone());

    TestEngine {
        engine,
        transcriber,
        generator,
        synthesizer,
    }
}

/// Like [`setup_test_engine`], with replies held until the generator is released
#[must_use]
pub fn setup_gated_engine(
    transcripts: &[&str],
    synthesizer: ScriptedSynthesizer,
) -> (VoiceEngine, Arc<GatedGenerator>) {
    let generator = Arc::new(GatedGenerator::new());
    let engine = build_engine(
        Arc::new(ScriptedTranscriber::new(transcripts)),
        generator.clone(),
        Arc::new(synthesizer),
    );
    (engine, generator)
}

fn build_engine(
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn Synthesizer>,
) -> VoiceEngine {
    let store = setup_test_store();

    VoiceEngine {
        conversations: Arc::new(ConversationManager::new(
            Arc::clone(&store),
            &SessionConfig::default(),
        )),
        transcriber: Arc::new(TranscriptionDispatcher::new(transcriber, 2, 16)),
        responder: Arc::new(ResponseDispatcher::new(
            generator,
            Duration::from_secs(5),
            RetryPolicy::with_retries(0),
            FALLBACK_TEXT,
        )),
        speech: SpeechStreamDispatcher::new(Arc::clone(&store), synthesizer, 4, 2, 16, STREAM_IDLE),
        store,
        vad: VadConfig::default(),
        utterance_queue: 2,
    }
}

/// 16-bit PCM frames: a 440 Hz tone at the given amplitude
#[must_use]
pub fn tone_frame(samples: usize, amplitude: f32) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            #[allow(clippy::cast_precision_loss)]
            let t = i as f32 / 16_000.0;
            amplitude * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
        })
        .collect()
}

/// Encode samples as little-endian 16-bit PCM
#[must_use]
pub fn to_pcm(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| {
            #[allow(clippy::cast_possible_truncation)]
            let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
            v.to_le_bytes()
        })
        .collect()
}

//! Per-connection voice turn pipeline
//!
//! Client audio goes to an intake task that segments it into utterances and
//! hands them to a single worker over a bounded channel. The worker
//! transcribes them in order, records the turn, asks the response generator
//! for a reply and starts a speech stream for it. While the worker is backed
//! up the intake task waits and client audio collects in a bounded backlog;
//! only when that is full does [`ConnectionPipeline::push_audio`] wait.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::agent::ResponseDispatcher;
use crate::config::VadConfig;
use crate::context::ConversationManager;
use crate::session::SessionStore;
use crate::voice::{
    Segment, SpeechRequest, SpeechStreamDispatcher, StreamEvent, StreamSink, TranscriptionDispatcher,
    UtteranceBuffer, UtteranceSegmenter,
};
use crate::{Error, Result};

/// Client audio writes buffered while the turn worker is backed up
const AUDIO_BACKLOG: usize = 256;

/// Shared components every connection pipeline draws on
#[derive(Clone)]
pub struct VoiceEngine {
    pub store: Arc<SessionStore>,
    pub conversations: Arc<ConversationManager>,
    pub transcriber: Arc<TranscriptionDispatcher>,
    pub responder: Arc<ResponseDispatcher>,
    pub speech: SpeechStreamDispatcher,
    pub vad: VadConfig,
    /// Utterances buffered per connection before audio intake pauses
    pub utterance_queue: usize,
}

impl VoiceEngine {
    /// Build a speech request for `text` using the session's preferences
    ///
    /// An explicit `language` wins over the session's `language` preference.
    ///
    /// # Errors
    ///
    /// Returns error if the durable store cannot be queried
    pub async fn speech_request(
        &self,
        session_id: &str,
        text: String,
        language: Option<String>,
        speaker_ref: Option<String>,
    ) -> Result<SpeechRequest> {
        let prefs = self
            .store
            .read(session_id, |session| {
                (
                    session.preference_text("voice").map(str::to_string),
                    session.preference_text("language").map(str::to_string),
                )
            })
            .await?;
        let (voice, preferred_language) = prefs.unwrap_or_default();

        Ok(SpeechRequest {
            text,
            voice,
            language: language.or(preferred_language),
            speaker_ref,
        })
    }
}

/// Turn-level notifications produced by the worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Text so far for speech that was cut at the maximum utterance length
    InterimTranscript { text: String, confidence: f32 },
    /// Complete user utterance
    FinalTranscript { text: String, confidence: f32 },
    AssistantResponse { text: String },
}

/// Audio intake and turn worker for one connection
pub struct ConnectionPipeline {
    session_id: String,
    store: Arc<SessionStore>,
    audio: mpsc::Sender<Vec<u8>>,
    intake: JoinHandle<()>,
    worker: JoinHandle<()>,
    /// Stops both tasks if the pipeline is dropped without `finish`
    _stop: DropGuard,
}

impl ConnectionPipeline {
    /// Start the intake and turn tasks; events go to `outbound`
    pub fn spawn<T>(engine: VoiceEngine, session_id: &str, outbound: mpsc::Sender<T>) -> Self
    where
        T: From<TurnEvent> + From<StreamEvent> + Send + 'static,
    {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_BACKLOG);
        let (work_tx, work_rx) = mpsc::channel(engine.utterance_queue.max(1));
        let stop = CancellationToken::new();

        let intake = AudioIntake {
            session_id: session_id.to_string(),
            segmenter: UtteranceSegmenter::new(engine.vad.clone()),
            work: work_tx,
            turn_open: false,
        };
        let worker = TurnWorker {
            engine: engine.clone(),
            session_id: session_id.to_string(),
            outbound,
            partial: None,
        };

        Self {
            session_id: session_id.to_string(),
            store: Arc::clone(&engine.store),
            audio: audio_tx,
            intake: spawn_until(stop.clone(), intake.run(audio_rx)),
            worker: spawn_until(stop.clone(), worker.run(work_rx)),
            _stop: stop.drop_guard(),
        }
    }

    /// Feed raw 16-bit PCM from the client
    ///
    /// Waits only when the audio backlog is full.
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be loaded or the pipeline has
    /// stopped
    pub async fn push_audio(&self, bytes: &[u8]) -> Result<()> {
        self.store.touch(&self.session_id).await?;

        self.audio
            .send(bytes.to_vec())
            .await
            .map_err(|_| Error::Audio("audio intake stopped".to_string()))
    }

    /// Flush any open utterance and wait for queued turns to finish
    pub async fn finish(self) {
        drop(self.audio);

        if let Err(e) = self.intake.await {
            tracing::warn!(session_id = %self.session_id, error = %e, "audio intake panicked");
        }
        if let Err(e) = self.worker.await {
            tracing::warn!(session_id = %self.session_id, error = %e, "turn worker panicked");
        }
    }
}

fn spawn_until<F>(stop: CancellationToken, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = stop.cancelled() => {}
            () = task => {}
        }
    })
}

/// Work handed from audio intake to the turn worker
enum Work {
    Utterance(UtteranceBuffer),
    /// Speech cut at the length cap stopped without a continuation
    SpeechEnded,
}

/// Segments client audio and queues utterances for the worker
struct AudioIntake {
    session_id: String,
    segmenter: UtteranceSegmenter,
    work: mpsc::Sender<Work>,
    /// The last utterance was cut at the length cap; its turn is still open
    turn_open: bool,
}

impl AudioIntake {
    async fn run(mut self, mut audio: mpsc::Receiver<Vec<u8>>) {
        while let Some(bytes) = audio.recv().await {
            for segment in self.segmenter.push_pcm(&bytes) {
                if self.dispatch(segment).await.is_err() {
                    tracing::debug!(session_id = %self.session_id, "turn worker stopped, dropping audio");
                    return;
                }
            }
        }

        if let Some(segment) = self.segmenter.flush()
            && self.dispatch(segment).await.is_err()
        {
            tracing::debug!(session_id = %self.session_id, "dropping final utterance");
        }
    }

    /// Waits while the worker's queue is full
    async fn dispatch(
        &mut self,
        segment: Segment,
    ) -> std::result::Result<(), mpsc::error::SendError<Work>> {
        let work = match segment {
            Segment::Utterance(utterance) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    duration = utterance.duration_secs(),
                    forced = utterance.forced,
                    "utterance segmented"
                );
                self.turn_open = utterance.forced;
                Work::Utterance(utterance)
            }
            Segment::Discarded(reason) => {
                tracing::debug!(session_id = %self.session_id, ?reason, "utterance discarded");
                if !std::mem::take(&mut self.turn_open) {
                    return Ok(());
                }
                Work::SpeechEnded
            }
            Segment::SpeechEnded => {
                if !std::mem::take(&mut self.turn_open) {
                    return Ok(());
                }
                Work::SpeechEnded
            }
        };

        self.work.send(work).await
    }
}

/// Text carried over from utterances cut at the length cap
struct Partial {
    text: String,
    confidence: f32,
}

struct TurnWorker<T> {
    engine: VoiceEngine,
    session_id: String,
    outbound: mpsc::Sender<T>,
    partial: Option<Partial>,
}

impl<T> TurnWorker<T>
where
    T: From<TurnEvent> + From<StreamEvent> + Send + 'static,
{
    async fn run(mut self, mut rx: mpsc::Receiver<Work>) {
        while let Some(work) = rx.recv().await {
            match work {
                Work::Utterance(utterance) => self.process(utterance).await,
                Work::SpeechEnded => self.close_turn().await,
            }
            if self.outbound.is_closed() {
                break;
            }
        }

        // Audio stopped while a cut utterance was waiting for its continuation
        if !self.outbound.is_closed() {
            self.close_turn().await;
        }
        tracing::debug!(session_id = %self.session_id, "turn worker stopped");
    }

    async fn process(&mut self, utterance: UtteranceBuffer) {
        let forced = utterance.forced;

        let transcript = match self.engine.transcriber.submit(&self.session_id, utterance).await {
            Ok(t) => Some(t),
            Err(Error::EmptyTranscript) => None,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "transcription failed, skipping utterance");
                None
            }
        };

        if let Some(t) = transcript {
            let partial = self.partial.get_or_insert(Partial {
                text: String::new(),
                confidence: t.confidence,
            });
            if !partial.text.is_empty() {
                partial.text.push(' ');
            }
            partial.text.push_str(&t.text);
            partial.confidence = partial.confidence.min(t.confidence);
        }

        if forced {
            if let Some(partial) = &self.partial {
                self.send(TurnEvent::InterimTranscript {
                    text: partial.text.clone(),
                    confidence: partial.confidence,
                })
                .await;
            }
            return;
        }

        self.close_turn().await;
    }

    /// Send the final transcript for the text heard so far and answer it
    async fn close_turn(&mut self) {
        let Some(Partial { text, confidence }) = self.partial.take() else {
            return;
        };

        self.send(TurnEvent::FinalTranscript {
            text: text.clone(),
            confidence,
        })
        .await;

        if let Err(e) = self.respond(&text).await {
            tracing::error!(session_id = %self.session_id, error = %e, "turn failed");
        }
    }

    async fn respond(&self, user_text: &str) -> Result<()> {
        let engine = &self.engine;
        let session_id = self.session_id.as_str();

        // Context is taken before the new turn so it only holds prior history
        let context = engine.conversations.context(session_id).await?;
        engine
            .conversations
            .record_user_turn(session_id, user_text)
            .await?;

        let reply = engine.responder.generate(&context, user_text).await;
        engine
            .conversations
            .record_assistant_turn(session_id, &reply)
            .await?;
        self.send(TurnEvent::AssistantResponse {
            text: reply.clone(),
        })
        .await;

        // The user spoke again; stop whatever is still playing
        if let Some(active) = engine.speech.active_stream(session_id) {
            match engine.speech.cancel(session_id, Some(&active)).await {
                Ok(()) => tracing::debug!(session_id, stream_id = %active, "barge-in cancelled stream"),
                Err(e) => tracing::debug!(session_id, error = %e, "stream ended before barge-in"),
            }
        }

        let request = engine.speech_request(session_id, reply, None, None).await?;
        let stream_id = format!("reply-{}", uuid::Uuid::new_v4());
        let sink: Arc<dyn StreamSink> = Arc::new(self.outbound.clone());
        engine
            .speech
            .start(session_id, &stream_id, request, sink)
            .await?;
        Ok(())
    }

    async fn send(&self, event: TurnEvent) {
        if self.outbound.send(T::from(event)).await.is_err() {
            tracing::debug!(session_id = %self.session_id, "client gone, dropping turn event");
        }
    }
}

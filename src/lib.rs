//! Murmur Gateway - real-time voice session engine
//!
//! Clients stream raw PCM over a WebSocket. The gateway:
//! - Segments audio into utterances with an energy-based VAD
//! - Transcribes utterances through a bounded dispatcher
//! - Keeps per-session conversation memory with topics, persisted to `SQLite`
//! - Generates replies with timeout, retry and fallback
//! - Streams synthesized speech back as ordered, cancellable chunks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │            WebSocket  /ws/voice   REST /api/sessions  │
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │  Segmenter → Transcription → Context → Response      │
//! │                                  │          │         │
//! │                          Session Store   Speech Stream│
//! └──────────────────────────┬───────────────────────────┘
//!                            │
//! ┌──────────────────────────▼───────────────────────────┐
//! │        SQLite snapshots      │      Session Reaper    │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod daemon;
pub mod db;
pub mod error;
pub mod pipeline;
pub mod session;
pub mod voice;

pub use agent::{ResponseDispatcher, ResponseGenerator, RetryPolicy};
pub use config::Config;
pub use context::{ConversationContext, ConversationManager, Topic};
pub use daemon::Daemon;
pub use db::{DbConn, DbPool, SessionRepo};
pub use error::{Error, Result};
pub use pipeline::{ConnectionPipeline, TurnEvent, VoiceEngine};
pub use session::{ConversationTurn, PreferenceValue, Session, SessionStore, TurnRole};
pub use voice::{
    SpeechRequest, SpeechStreamDispatcher, StreamEvent, Synthesizer, Transcriber,
    TranscriptionDispatcher, UtteranceSegmenter,
};

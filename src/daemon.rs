//! Daemon - the main gateway service
//!
//! Wires the session store, engines and dispatchers together, runs the
//! reaper and the API server, and flushes every live session on shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::ResponseDispatcher;
use crate::api::ApiServerBuilder;
use crate::context::ConversationManager;
use crate::db::{self, DbPool, SessionRepo};
use crate::pipeline::VoiceEngine;
use crate::session::{SessionStore, spawn_reaper};
use crate::voice::{SpeechStreamDispatcher, TranscriptionDispatcher};
use crate::{Config, Result};

/// File name of the session database inside the data directory
pub const DATABASE_FILE: &str = "sessions.db";

/// Build the shared voice components from configuration
///
/// # Errors
///
/// Returns error if an engine's HTTP client cannot be built
pub fn build_engine(config: &Config, store: Arc<SessionStore>) -> Result<VoiceEngine> {
    let conversations = Arc::new(ConversationManager::new(Arc::clone(&store), &config.session));
    let transcriber = Arc::new(TranscriptionDispatcher::from_config(&config.stt)?);
    let responder = Arc::new(ResponseDispatcher::from_config(&config.llm)?);
    let speech = SpeechStreamDispatcher::from_config(Arc::clone(&store), &config.tts)?;

    tracing::info!(
        stt = %config.stt.model,
        llm = %config.llm.model,
        tts = %config.tts.model,
        voice = %config.tts.voice,
        "engines configured"
    );

    Ok(VoiceEngine {
        store,
        conversations,
        transcriber,
        responder,
        speech,
        vad: config.vad.clone(),
        utterance_queue: config.server.utterance_queue,
    })
}

/// The Murmur daemon
pub struct Daemon {
    config: Config,
    db: DbPool,
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// # Errors
    ///
    /// Returns error if the session database cannot be opened
    pub fn new(config: Config) -> Result<Self> {
        let db_path = config.data_dir.join(DATABASE_FILE);
        let db = db::init(&db_path)?;

        tracing::info!(path = %db_path.display(), "session database opened");

        Ok(Self { config, db })
    }

    /// Run until Ctrl-C
    ///
    /// # Errors
    ///
    /// Returns error if the engines cannot be built or the server fails
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            signal.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run until `shutdown` is cancelled
    ///
    /// # Errors
    ///
    /// Returns error if the engines cannot be built or the server fails
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let store = Arc::new(SessionStore::new(SessionRepo::new(self.db.clone())));
        let engine = build_engine(&self.config, Arc::clone(&store))?;

        let reaper = spawn_reaper(Arc::clone(&store), &self.config.session, shutdown.child_token());

        let server = ApiServerBuilder::new(engine, self.config.server.port)
            .api_key(self.config.server.api_key.clone())
            .rate_limit_per_minute(self.config.server.rate_limit_per_minute)
            .build();

        let server_shutdown = shutdown.clone();
        let result = server
            .run(async move { server_shutdown.cancelled().await })
            .await;

        // The server may also stop on its own error
        shutdown.cancel();
        if let Err(e) = reaper.await {
            tracing::warn!(error = %e, "session reaper task failed");
        }

        let saved = store.flush_all().await;
        tracing::info!(sessions = saved, "active sessions flushed");

        result
    }
}

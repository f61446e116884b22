//! WebSocket handler for voice sessions
//!
//! Binary frames carry 16-bit little-endian mono PCM and feed the
//! connection's pipeline. Text frames are JSON control messages tagged by
//! `type`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::ApiState;
use crate::pipeline::{ConnectionPipeline, TurnEvent, VoiceEngine};
use crate::session::PreferenceValue;
use crate::voice::{AdmissionStats, StreamEvent, StreamSink, StreamingStats};
use crate::{Error, Result};

/// Outbound messages buffered per connection
const OUTBOUND_BUFFER: usize = 64;

/// Longest accepted session id
const MAX_SESSION_ID_LEN: usize = 128;

/// Query parameters for the WebSocket connection
#[derive(Debug, Deserialize)]
struct WsQuery {
    /// Resume this session; a new id is generated when absent
    session_id: Option<String>,
}

/// Incoming control message from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Speak arbitrary text on this session
    StartTtsStream {
        #[serde(default)]
        stream_id: Option<String>,
        text: String,
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        speaker_ref: Option<String>,
    },
    /// Cancel the active stream
    StopTtsStream {
        #[serde(default)]
        stream_id: Option<String>,
    },
    GetStreamingStats,
    /// Store a session preference such as `voice` or `language`
    SetPreference { key: String, value: PreferenceValue },
    /// Ping to keep connection alive
    Ping,
}

/// Connection-level replies
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Connection established
    Connected {
        session_id: String,
        /// The session already had conversation history
        returning: bool,
        turn_count: usize,
        topics: Vec<String>,
    },
    StreamingStats {
        #[serde(flatten)]
        streaming: StreamingStats,
        transcription: AdmissionStats,
    },
    PreferenceSet {
        key: String,
        value: PreferenceValue,
    },
    /// Error occurred
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
    /// Pong response
    Pong,
}

/// Outgoing WebSocket message to client
///
/// Every variant serializes as a flat object with its own `type` tag.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WsOutgoing {
    Control(ControlMessage),
    Turn(TurnEvent),
    Stream(StreamEvent),
}

impl WsOutgoing {
    fn error(e: &Error) -> Self {
        Self::Control(ControlMessage::Error {
            code: e.code().to_string(),
            message: e.to_string(),
            retryable: e.is_retryable(),
        })
    }
}

impl From<ControlMessage> for WsOutgoing {
    fn from(msg: ControlMessage) -> Self {
        Self::Control(msg)
    }
}

impl From<TurnEvent> for WsOutgoing {
    fn from(event: TurnEvent) -> Self {
        Self::Turn(event)
    }
}

impl From<StreamEvent> for WsOutgoing {
    fn from(event: StreamEvent) -> Self {
        Self::Stream(event)
    }
}

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice", get(ws_upgrade))
        .with_state(state)
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = query
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    if !is_valid_session_id(&session_id) {
        tracing::warn!(session_id = %session_id, "rejecting WebSocket with invalid session id");
        return (StatusCode::BAD_REQUEST, "invalid session_id").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>, session_id: String) {
    let (mut sender, receiver) = socket.split();
    let engine = state.engine.clone();

    let connected = match engine.store.get_or_create(&session_id).await {
        Ok(session) => WsOutgoing::Control(ControlMessage::Connected {
            session_id: session_id.clone(),
            returning: !session.turns.is_empty(),
            turn_count: session.turns.len(),
            topics: session.topics.iter().cloned().collect(),
        }),
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "failed to load session");
            WsOutgoing::error(&e)
        }
    };
    let failed = matches!(connected, WsOutgoing::Control(ControlMessage::Error { .. }));

    if let Ok(msg) = serde_json::to_string(&connected)
        && sender.send(Message::Text(msg.into())).await.is_err()
    {
        return;
    }
    if failed {
        return;
    }

    tracing::info!(session_id = %session_id, "WebSocket connected");

    // Create channel for sending messages back to client
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(OUTBOUND_BUFFER);

    // Spawn task to forward messages from channel to WebSocket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(text) = serde_json::to_string(&msg)
                && sender.send(Message::Text(text.into())).await.is_err()
            {
                break;
            }
        }
    });

    // Wait for either side to finish
    tokio::select! {
        _ = &mut send_task => {}
        () = serve_connection(receiver, engine.clone(), &session_id, tx) => send_task.abort(),
    }

    if engine.speech.cancel(&session_id, None).await.is_ok() {
        tracing::debug!(session_id = %session_id, "cancelled stream on disconnect");
    }

    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}

/// Read client frames until the connection closes
///
/// Binary frames go to the connection's pipeline, which only waits once its
/// audio backlog is full. Control messages are handled as they arrive, so a
/// `stop_tts_stream` takes effect while earlier turns are still queued.
/// Queued turns are finished before this returns.
pub async fn serve_connection<S>(
    mut receiver: S,
    engine: VoiceEngine,
    session_id: &str,
    tx: mpsc::Sender<WsOutgoing>,
) where
    S: Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
{
    let pipeline = ConnectionPipeline::spawn(engine.clone(), session_id, tx.clone());

    while let Some(Ok(msg)) = receiver.next().await {
        let result = match msg {
            Message::Binary(data) => pipeline.push_audio(&data).await,
            Message::Text(text) => handle_message(&text, &engine, session_id, &tx).await,
            Message::Close(_) => {
                tracing::info!(session_id, "WebSocket closed by client");
                break;
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            tracing::debug!(session_id, error = %e, "client message failed");
            let _ = tx.send(WsOutgoing::error(&e)).await;
        }
    }

    pipeline.finish().await;
}

/// Handle a single control message
async fn handle_message(
    text: &str,
    engine: &VoiceEngine,
    session_id: &str,
    tx: &mpsc::Sender<WsOutgoing>,
) -> Result<()> {
    let incoming: WsIncoming =
        serde_json::from_str(text).map_err(|e| Error::Protocol(e.to_string()))?;

    match incoming {
        WsIncoming::Ping => {
            reply(tx, ControlMessage::Pong).await;
        }
        WsIncoming::StartTtsStream {
            stream_id,
            text,
            language,
            speaker_ref,
        } => {
            if text.trim().is_empty() {
                return Err(Error::Protocol("start_tts_stream needs text".to_string()));
            }
            engine.store.touch(session_id).await?;

            let stream_id = stream_id.unwrap_or_else(|| format!("tts-{}", uuid::Uuid::new_v4()));
            let request = engine
                .speech_request(session_id, text, language, speaker_ref)
                .await?;
            let sink: Arc<dyn StreamSink> = Arc::new(tx.clone());
            engine
                .speech
                .start(session_id, &stream_id, request, sink)
                .await?;
        }
        WsIncoming::StopTtsStream { stream_id } => {
            engine.store.touch(session_id).await?;
            engine.speech.cancel(session_id, stream_id.as_deref()).await?;
        }
        WsIncoming::GetStreamingStats => {
            reply(
                tx,
                ControlMessage::StreamingStats {
                    streaming: engine.speech.stats(),
                    transcription: engine.transcriber.stats(),
                },
            )
            .await;
        }
        WsIncoming::SetPreference { key, value } => {
            let key = key.trim().to_string();
            if key.is_empty() {
                return Err(Error::Protocol("preference key is empty".to_string()));
            }
            engine
                .store
                .update(session_id, |session| {
                    session.preferences.insert(key.clone(), value.clone());
                })
                .await?;
            tracing::debug!(session_id, key = %key, "preference set");
            reply(tx, ControlMessage::PreferenceSet { key, value }).await;
        }
    }

    Ok(())
}

async fn reply(tx: &mpsc::Sender<WsOutgoing>, msg: ControlMessage) {
    if tx.send(msg.into()).await.is_err() {
        tracing::debug!("client gone, dropping reply");
    }
}

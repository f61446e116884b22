//! Session inspection endpoints
//!
//! Read-only views of conversation memory, plus clearing a session's memory.
//! Reads never create or activate a session.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    routing::{delete, get},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiState, auth::require_api_key, error_response};
use crate::context::{ConversationContext, ConversationSummary};
use crate::session::ConversationTurn;

#[derive(Serialize)]
pub struct SessionListEntry {
    pub id: String,
    pub active: bool,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Serialize)]
pub struct TopicsResponse {
    pub session_id: String,
    pub topics: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextQuery {
    pub max_chars: Option<usize>,
}

#[derive(Serialize)]
pub struct ContextResponse {
    pub session_id: String,
    pub max_chars: usize,
    pub context: ConversationContext,
    /// History as it would be framed for the response generator
    pub prompt_preview: String,
}

fn not_found(id: &str) -> ApiError {
    error_response(
        StatusCode::NOT_FOUND,
        "not_found",
        &format!("session {id} not found"),
    )
}

/// List persisted sessions, most recently active first
async fn list_sessions(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<SessionListEntry>>, ApiError> {
    let store = &state.engine.store;
    let mut ids = store.repo().list_ids()?;

    // Sessions created since their last write-through may not be on disk yet
    for id in store.active_ids().await {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let active = store.is_active(&id).await;
        entries.push(SessionListEntry { id, active });
    }
    Ok(Json(entries))
}

async fn get_history(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let turns = state
        .engine
        .conversations
        .history(&id)
        .await?
        .ok_or_else(|| not_found(&id))?;

    Ok(Json(HistoryResponse {
        session_id: id,
        turns,
    }))
}

async fn get_summary(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationSummary>, ApiError> {
    let summary = state
        .engine
        .conversations
        .summary(&id)
        .await?
        .ok_or_else(|| not_found(&id))?;
    Ok(Json(summary))
}

async fn get_topics(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<TopicsResponse>, ApiError> {
    let topics = state
        .engine
        .conversations
        .topics(&id)
        .await?
        .ok_or_else(|| not_found(&id))?;

    Ok(Json(TopicsResponse {
        session_id: id,
        topics,
    }))
}

/// Preview of the context the next reply would be generated from
async fn get_context(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(query): Query<ContextQuery>,
) -> Result<Json<ContextResponse>, ApiError> {
    let conversations = &state.engine.conversations;
    let max_chars = query
        .max_chars
        .unwrap_or_else(|| conversations.max_context_chars());

    let context = conversations
        .context_with_budget(&id, max_chars)
        .await?
        .ok_or_else(|| not_found(&id))?;

    Ok(Json(ContextResponse {
        session_id: id,
        max_chars,
        prompt_preview: context.format_prompt("").trim_end().to_string(),
        context,
    }))
}

/// Forget a session's turns and topics; preferences are kept
async fn clear_session(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.engine.conversations.clear(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(&id))
    }
}

/// Build the session router, mounted at `/api/sessions`
pub fn router(state: Arc<ApiState>) -> Router {
    let protected = Router::new()
        .route("/{id}", delete(clear_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(list_sessions))
        .route("/{id}/history", get(get_history))
        .route("/{id}/summary", get(get_summary))
        .route("/{id}/topics", get(get_topics))
        .route("/{id}/context", get(get_context))
        .merge(protected)
        .with_state(state)
}

//! HTTP API server for the Murmur gateway

mod auth;
pub mod health;
pub mod rate_limit;
pub mod sessions;
pub mod websocket;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::pipeline::VoiceEngine;

/// Shared state for API handlers
pub struct ApiState {
    pub engine: VoiceEngine,
    pub api_key: Option<String>,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// JSON error body shared by the REST handlers
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Status and body for a failed REST call
pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
}

impl From<crate::Error> for ApiError {
    fn from(e: crate::Error) -> Self {
        let status = match &e {
            crate::Error::NotFound(_) => StatusCode::NOT_FOUND,
            crate::Error::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "request failed");
        }
        error_response(status, e.code(), &e.to_string())
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    engine: VoiceEngine,
    port: u16,
    api_key: Option<String>,
    rate_limit_per_minute: u32,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(engine: VoiceEngine, port: u16) -> Self {
        Self {
            engine,
            port,
            api_key: None,
            rate_limit_per_minute: 0,
        }
    }

    /// Set API key for destructive endpoints
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Limit inspection requests per minute (0 disables limiting)
    #[must_use]
    pub const fn rate_limit_per_minute(mut self, rpm: u32) -> Self {
        self.rate_limit_per_minute = rpm;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let rate_limiter =
            (self.rate_limit_per_minute > 0).then(|| rate_limit::create_limiter(self.rate_limit_per_minute));

        ApiServer {
            state: Arc::new(ApiState {
                engine: self.engine,
                api_key: self.api_key,
                rate_limiter,
            }),
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let inspection = sessions::router(self.state.clone()).layer(
            axum::middleware::from_fn_with_state(self.state.clone(), rate_limit::rate_limit_middleware),
        );

        let router = Router::new()
            .nest("/api/sessions", inspection)
            .nest("/ws", websocket::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}

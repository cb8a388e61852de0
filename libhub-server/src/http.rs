//! Library Hub HTTP REST API
//!
//! Each endpoint has a thin axum handler that delegates to an inner function
//! returning `(StatusCode, serde_json::Value)`, so the logic can be tested
//! without going through the router. `/chat` is the exception: it streams a
//! `text/plain` body.
//!
//! Endpoints:
//! - POST /chat: streamed reply, book cards after `__JSON_START__`
//! - POST /chat/sync: the same reply as one JSON document
//! - POST /search: semantic catalog search
//! - POST /reindex: embed the whole catalog again
//! - GET  /health: component status
//! - GET  /version: server version info

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use libhub_core::embeddings::EmbeddingError;
use libhub_core::generation::GenerationError;
use libhub_core::models::{BookCard, ConversationTurn};
use libhub_core::retriever::{requested_limit, RetrievalError, SearchFilters};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::state::AppState;
use crate::subsystems::chat::{ChatError, ChatEvent};
use crate::subsystems::indexer::{index_catalog, IndexMode};

/// Separates the streamed reply text from the JSON array of book cards.
pub const CARDS_MARKER: &str = "\n\n__JSON_START__\n";

/// Response header carrying the chat session id.
pub const SESSION_HEADER: &str = "x-session-id";

const TRY_AGAIN: &str = "Something went wrong on our side. Please try again.";

const STREAM_INTERRUPTED: &str = "\n\n[The reply was interrupted. Please try again.]";

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/search", post(search_handler))
        .route("/reindex", post(reindex_handler))
        .route("/chat", post(chat_handler))
        .route("/chat/sync", post(chat_sync_handler))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = format!("{}:{}", state.config.http.host, state.config.http.port);

    let app = build_router(state);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Library Hub HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request / Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub filters: Option<SearchFilters>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ConversationTurn>,
    /// Reuse retrievals across requests of one conversation.
    pub session_id: Option<Uuid>,
}

/// Standard HTTP error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: String,
}

impl ErrorResponse {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            error: msg.into(),
            status: "error".to_string(),
        }
    }

    fn body(msg: impl Into<String>) -> serde_json::Value {
        serde_json::to_value(Self::new(msg)).unwrap_or_default()
    }
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check: reports catalog, index and database status.
pub async fn health_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    let catalog = match state.catalog.status().await {
        Ok(s) => s,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": format!("catalog: {e}"),
                }),
            );
        }
    };

    let indexed = match state.index.len().await {
        Ok(n) => n,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({
                    "status": "unhealthy",
                    "error": format!("index: {e}"),
                }),
            );
        }
    };

    let (postgresql, pgvector) = match &state.pool {
        Some(pool) => (
            libhub_core::db::health_check(pool)
                .await
                .unwrap_or_else(|e| format!("unavailable: {}", e)),
            libhub_core::db::check_pgvector(pool)
                .await
                .unwrap_or_else(|e| format!("unavailable: {}", e)),
        ),
        None => ("not configured".to_string(), "not configured".to_string()),
    };

    (
        StatusCode::OK,
        serde_json::json!({
            "status": "healthy",
            "version": env!("CARGO_PKG_VERSION"),
            "catalog": {
                "source": state.catalog.name(),
                "status": catalog,
            },
            "index": {
                "backend": state.index.name(),
                "documents": indexed,
                "dimensions": state.index.dimensions(),
            },
            "embedder": state.backend.name(),
            "generator": state.chat.generator().name(),
            "postgresql": postgresql,
            "pgvector": pgvector,
        }),
    )
}

/// Inner version: returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "libhub/1",
    })
}

/// Inner search: validates the query and runs a filtered retrieval.
pub async fn search_inner(state: &AppState, req: SearchRequest) -> (StatusCode, serde_json::Value) {
    let query = match req.query {
        Some(q) if !q.trim().is_empty() => q,
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                ErrorResponse::body("query field is required"),
            );
        }
    };

    let max_k = state.config.retrieval.max_k;
    let limit = req
        .limit
        .map(|l| l.clamp(1, max_k.max(1)))
        .unwrap_or_else(|| requested_limit(&query, state.config.retrieval.default_k, max_k));
    let filters = req.filters.unwrap_or_default();

    let start = Instant::now();
    let result = state.retriever.retrieve_filtered(&query, limit, &filters).await;
    let took_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(retrieval) => (
            StatusCode::OK,
            serde_json::json!({
                "results": retrieval.documents,
                "query": query,
                "count": retrieval.len(),
                "took_ms": took_ms,
            }),
        ),
        Err(RetrievalError::Embedding(
            e @ (EmbeddingError::EmptyInput | EmbeddingError::InputTooLong { .. }),
        )) => (StatusCode::BAD_REQUEST, ErrorResponse::body(e.to_string())),
        Err(e) => {
            tracing::error!(error = %e, "Search failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(TRY_AGAIN))
        }
    }
}

/// Inner reindex: a full indexing pass over the catalog.
pub async fn reindex_inner(state: &AppState) -> (StatusCode, serde_json::Value) {
    let result = index_catalog(
        state.catalog.as_ref(),
        state.backend.as_ref(),
        state.index.as_ref(),
        IndexMode::Full,
        state.config.index.rate_limit_rpm,
    )
    .await;

    match result {
        Ok(report) => (
            StatusCode::OK,
            serde_json::to_value(report).unwrap_or_default(),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Reindex failed");
            (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::body(TRY_AGAIN))
        }
    }
}

/// Inner chat: runs the whole reply and returns it as one document.
pub async fn chat_sync_inner(state: &AppState, req: ChatRequest) -> (StatusCode, serde_json::Value) {
    let reply = match state.chat.start(req.messages, req.session_id).await {
        Ok(r) => r,
        Err(e) => return chat_error(&e),
    };
    let session_id = reply.session_id();

    let mut text = String::new();
    let mut events = Box::pin(reply.into_stream());
    while let Some(event) = events.next().await {
        match event {
            Ok(ChatEvent::Text(t)) => text.push_str(&t),
            Ok(ChatEvent::Books(cards)) => text.push_str(&render_cards(&cards)),
            Err(e) => return chat_error(&e),
        }
    }

    (
        StatusCode::OK,
        serde_json::json!({
            "response": text,
            "session_id": session_id,
        }),
    )
}

// ============================================================================
// Axum handler wrappers (thin: delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> impl IntoResponse {
    let (status, body) = search_inner(&state, req).await;
    (status, Json(body))
}

pub async fn reindex_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (status, body) = reindex_inner(&state).await;
    (status, Json(body))
}

pub async fn chat_sync_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    let (status, body) = chat_sync_inner(&state, req).await;
    (status, Json(body))
}

/// Streams the reply as it is generated. A client disconnect drops the body,
/// which drops the reply and cancels generation.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Response {
    let reply = match state.chat.start(req.messages, req.session_id).await {
        Ok(r) => r,
        Err(e) => {
            let (status, body) = chat_error(&e);
            return (status, Json(body)).into_response();
        }
    };
    let session_id = reply.session_id().to_string();

    let body = reply.into_stream().map(|event| {
        let chunk = match event {
            Ok(ChatEvent::Text(t)) => t,
            Ok(ChatEvent::Books(cards)) => render_cards(&cards),
            Err(e) => {
                tracing::warn!(error = %e, "Chat stream ended early");
                STREAM_INTERRUPTED.to_string()
            }
        };
        Ok::<_, Infallible>(Bytes::from(chunk))
    });

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (HeaderName::from_static(SESSION_HEADER), session_id),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

// ============================================================================
// Helpers
// ============================================================================

/// Card trailer appended after the reply text.
pub fn render_cards(cards: &[BookCard]) -> String {
    let json = serde_json::to_string(cards).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to serialise book cards");
        "[]".to_string()
    });
    format!("{CARDS_MARKER}{json}")
}

/// Map a chat failure to a status and body. Internal details are logged, not returned.
pub fn chat_error(e: &ChatError) -> (StatusCode, serde_json::Value) {
    if e.is_client_error() {
        return (StatusCode::BAD_REQUEST, ErrorResponse::body(e.to_string()));
    }

    tracing::error!(error = %e, "Chat request failed");
    let status = match e {
        ChatError::Generation(GenerationError::Unavailable(_) | GenerationError::Timeout(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ChatError::Generation(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, ErrorResponse::body(TRY_AGAIN))
}

// ============================================================================
// Unit Tests: call inner functions directly
// ============================================================================

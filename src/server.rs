//! HTTP API for the sales question-answering service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service name and version |
//! | `GET`  | `/api/health` | Index / generator status |
//! | `POST` | `/api/chat` | Ask a question, get `{answer, sources}` |
//! | `POST` | `/api/rebuild-index` | Re-ingest the spreadsheet and swap the index |
//! | `POST` | `/api/chats` | Create a chat session |
//! | `GET`  | `/api/chats?user_id=` | List a user's sessions |
//! | `GET`  | `/api/chats/{id}` | Session detail with messages |
//! | `POST` | `/api/chats/{id}/message` | Ask within a session and persist both turns |
//! | `DELETE` | `/api/chats/{id}` | Delete a session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_ready", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_ready` (503),
//! `upstream` (502), `internal` (500).
//!
//! # Startup
//!
//! Ingestion runs before the listener starts. If it fails the server still
//! comes up degraded: health reports `index_loaded: false` and query
//! endpoints answer 503 until a successful `POST /api/rebuild-index`.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! frontends.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::chats::{ChatDetail, ChatStore, ChatSummary};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, EmbeddingProvider};
use crate::generate::{Generator, OllamaGenerator};
use crate::migrate;
use crate::pipeline::{self, Answer, ChatTurn, RagEngine};

/// The engine slot: `None` until the first successful ingestion. Queries
/// clone the inner `Arc` under a read lock; rebuilds swap it under a brief
/// write lock, so a half-built index is never observable.
type EngineSlot = Arc<RwLock<Option<Arc<RagEngine>>>>;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    engine: EngineSlot,
    chats: ChatStore,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Arc<dyn Generator>,
}

/// Starts the HTTP server.
///
/// Ingests the spreadsheet first (degraded startup on failure), then binds
/// to `[server].bind` and serves until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let embedder = embedding::create_provider(&config.embedding)?;
    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&config.generation)?);

    let pool = db::connect(&config.db).await?;
    migrate::run_migrations(&pool).await?;
    let chats = ChatStore::new(pool);

    let engine: EngineSlot = Arc::new(RwLock::new(None));
    match pipeline::build_engine(&config, embedder.clone(), generator.clone(), false).await {
        Ok(built) => {
            info!(documents = built.document_count(), "RAG engine ready");
            *engine.write().await = Some(Arc::new(built));
        }
        Err(e) => {
            // Keep serving; health reports the degraded state and a later
            // rebuild can recover without a restart.
            error!(error = %e, "Ingestion failed; starting degraded");
        }
    }

    let state = AppState {
        config,
        engine,
        chats,
        embedder,
        generator,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(handle_root))
        .route("/api/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/rebuild-index", post(handle_rebuild))
        .route("/api/chats", post(handle_create_chat).get(handle_list_chats))
        .route(
            "/api/chats/{id}",
            get(handle_get_chat).delete(handle_delete_chat),
        )
        .route("/api/chats/{id}/message", post(handle_chat_message))
        .layer(cors)
        .with_state(state);

    println!("API server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// 503 for requests that need the engine before ingestion has succeeded.
fn not_ready() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "not_ready".to_string(),
        message: "RAG engine not initialized; ingest the spreadsheet or call /api/rebuild-index"
            .to_string(),
    }
}

/// 502 for embedding/generation backend failures during a query.
fn upstream(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "upstream".to_string(),
        message: err.to_string(),
    }
}

fn internal(err: anyhow::Error) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: err.to_string(),
    }
}

// ============ GET / ============

#[derive(Serialize)]
struct RootResponse {
    name: String,
    version: String,
}

async fn handle_root() -> Json<RootResponse> {
    Json(RootResponse {
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /api/health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    index_loaded: bool,
    generator_available: bool,
    model: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let index_loaded = state.engine.read().await.is_some();
    let generator_available = state.generator.is_reachable().await;

    Json(HealthResponse {
        status: if index_loaded { "ok" } else { "degraded" }.to_string(),
        index_loaded,
        generator_available,
        model: state.generator.model_name().to_string(),
    })
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let engine = current_engine(&state).await.ok_or_else(not_ready)?;
    // The question was validated above, so any answer error is a backend
    // failure.
    let answer = engine
        .answer(&req.question, &req.history)
        .await
        .map_err(upstream)?;

    Ok(Json(answer))
}

// ============ POST /api/rebuild-index ============

#[derive(Serialize)]
struct RebuildResponse {
    status: String,
    documents: usize,
}

async fn handle_rebuild(
    State(state): State<AppState>,
) -> Result<Json<RebuildResponse>, AppError> {
    info!("Index rebuild requested");

    // Build the replacement fully before taking the write lock; queries keep
    // serving from the old engine until the swap.
    let built = pipeline::build_engine(
        &state.config,
        state.embedder.clone(),
        state.generator.clone(),
        true,
    )
    .await
    .map_err(internal)?;

    let documents = built.document_count();
    *state.engine.write().await = Some(Arc::new(built));
    info!(documents, "Index rebuilt and swapped");

    Ok(Json(RebuildResponse {
        status: "rebuilt".to_string(),
        documents,
    }))
}

// ============ Chat sessions ============

#[derive(Deserialize)]
struct ChatCreateRequest {
    user_id: String,
    #[serde(default)]
    first_message: Option<String>,
}

async fn handle_create_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatCreateRequest>,
) -> Result<Json<ChatDetail>, AppError> {
    if req.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    let chat = state
        .chats
        .create(&req.user_id, req.first_message.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(chat))
}

#[derive(Deserialize)]
struct ListChatsQuery {
    user_id: String,
}

async fn handle_list_chats(
    State(state): State<AppState>,
    Query(query): Query<ListChatsQuery>,
) -> Result<Json<Vec<ChatSummary>>, AppError> {
    let chats = state.chats.list(&query.user_id).await.map_err(internal)?;
    Ok(Json(chats))
}

async fn handle_get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatDetail>, AppError> {
    state
        .chats
        .get(&id)
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| not_found(format!("no chat with id: {}", id)))
}

#[derive(Deserialize)]
struct ChatMessageRequest {
    user_id: String,
    question: String,
}

async fn handle_chat_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ChatMessageRequest>,
) -> Result<Json<Answer>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let engine = current_engine(&state).await.ok_or_else(not_ready)?;

    // Ownership check before spending an LLM call
    let session = state.chats.get(&id).await.map_err(internal)?;
    match session {
        Some(s) if s.user_id == req.user_id => {}
        _ => return Err(not_found(format!("no chat with id: {}", id))),
    }

    let answer = engine
        .answer(&req.question, &[])
        .await
        .map_err(upstream)?;

    let persisted = state
        .chats
        .append_exchange(&id, &req.user_id, &req.question, &answer.answer)
        .await
        .map_err(internal)?;
    if !persisted {
        warn!(chat_id = %id, "Chat session disappeared before persisting exchange");
    }

    Ok(Json(answer))
}

#[derive(Serialize)]
struct DeleteResponse {
    status: String,
}

async fn handle_delete_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let deleted = state.chats.delete(&id).await.map_err(internal)?;
    if !deleted {
        return Err(not_found(format!("no chat with id: {}", id)));
    }
    Ok(Json(DeleteResponse {
        status: "deleted".to_string(),
    }))
}

/// Snapshot the current engine without holding the lock across a query.
async fn current_engine(state: &AppState) -> Option<Arc<RagEngine>> {
    state.engine.read().await.clone()
}

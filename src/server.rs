use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::{ChatMessage, ChatUpdate, ChatWithMessages, GenerationRequest, Role};
use crate::ollama::{GenerationBackend, OllamaClient};
use crate::relay;
use crate::storage::StorageManager;
use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

// Core application state shared by all handlers
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageManager>,
    pub backend: Arc<dyn GenerationBackend>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chats", get(list_chats).post(create_chat))
        .route(
            "/api/chats/{id}",
            get(get_chat).patch(update_chat).delete(delete_chat),
        )
        .route("/api/messages", get(list_messages).post(create_message))
        .route("/api/models", get(list_models))
        .route("/api/chat/completion", post(chat_completion))
        .route("/api/chat/stream", post(chat_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wires up storage and the generation backend, then serves forever.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let storage = Arc::new(StorageManager::new(&config.database_path).await?);
    let backend: Arc<dyn GenerationBackend> = Arc::new(OllamaClient::new(&config.ollama_url));
    let app = router(AppState { storage, backend });

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    log::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

// --- Chat CRUD ---

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListChatsParams {
    include_archived: bool,
}

async fn list_chats(
    State(state): State<AppState>,
    Query(params): Query<ListChatsParams>,
) -> Result<Json<Vec<ChatWithMessages>>, ApiError> {
    let chats = state.storage.list_chats(params.include_archived).await?;
    let mut result = Vec::with_capacity(chats.len());
    for chat in chats {
        let messages = state.storage.list_messages(chat.id).await?;
        result.push(ChatWithMessages { chat, messages });
    }
    Ok(Json(result))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct NewChat {
    title: Option<String>,
}

async fn create_chat(
    State(state): State<AppState>,
    Json(body): Json<NewChat>,
) -> Result<(StatusCode, Json<ChatWithMessages>), ApiError> {
    let chat = state.storage.create_chat(body.title, None).await?;
    Ok((
        StatusCode::CREATED,
        Json(ChatWithMessages {
            chat,
            messages: Vec::new(),
        }),
    ))
}

async fn get_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatWithMessages>, ApiError> {
    let chat_id = parse_chat_id(&id)?;
    let chat = state
        .storage
        .get_chat_with_messages(chat_id)
        .await?
        .ok_or_else(ApiError::chat_not_found)?;
    Ok(Json(chat))
}

async fn update_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ChatUpdate>,
) -> Result<Json<ChatWithMessages>, ApiError> {
    let chat_id = parse_chat_id(&id)?;
    let updated = state
        .storage
        .update_chat(chat_id, &update)
        .await?
        .ok_or_else(ApiError::chat_not_found)?;
    let messages = state.storage.list_messages(updated.id).await?;
    Ok(Json(ChatWithMessages {
        chat: updated,
        messages,
    }))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chat_id = parse_chat_id(&id)?;
    if !state.storage.delete_chat(chat_id).await? {
        return Err(ApiError::chat_not_found());
    }
    Ok(Json(json!({ "message": "chat deleted" })))
}

// An id that is not a UUID cannot name an existing chat.
fn parse_chat_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::chat_not_found())
}

// --- Messages ---

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct NewMessage {
    chat_id: Option<String>,
    role: Option<String>,
    content: Option<String>,
}

async fn create_message(
    State(state): State<AppState>,
    Json(body): Json<NewMessage>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let (Some(chat_id), Some(role), Some(content)) = (body.chat_id, body.role, body.content)
    else {
        return Err(ApiError::MissingParameter(
            "chatId, role and content are required".to_string(),
        ));
    };

    let role: Role = role.parse().map_err(|_| {
        ApiError::MissingParameter("role must be USER, ASSISTANT or SYSTEM".to_string())
    })?;
    let chat_id = parse_chat_id(&chat_id)?;
    if state.storage.get_chat(chat_id).await?.is_none() {
        return Err(ApiError::chat_not_found());
    }

    let message = state.storage.create_message(chat_id, role, &content).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct ListMessagesParams {
    chat_id: Option<String>,
}

async fn list_messages(
    State(state): State<AppState>,
    Query(params): Query<ListMessagesParams>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    let Some(raw) = params.chat_id else {
        return Err(ApiError::MissingParameter("chatId is required".to_string()));
    };
    // An unknown (or unparseable) chat simply has no messages.
    let Ok(chat_id) = Uuid::parse_str(&raw) else {
        return Ok(Json(Vec::new()));
    };
    Ok(Json(state.storage.list_messages(chat_id).await?))
}

// --- Models ---

// Model-listing failures degrade to an empty list so the client always
// receives something renderable.
async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.backend.list_models().await {
        Ok(models) => Json(json!({ "models": models })),
        Err(err) => {
            log::warn!("Model listing unavailable: {:#}", err);
            Json(json!({
                "models": [],
                "error": "could not reach the generation service; is it running?",
            }))
        }
    }
}

// --- Generation ---

async fn chat_completion(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = relay::complete(&state.storage, state.backend.as_ref(), request).await?;
    Ok(Json(json!({
        "content": message.content,
        "messageId": message.id,
    })))
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    let prepared = match relay::prepare(&state.storage, request).await {
        Ok(prepared) => prepared,
        Err(err) => return plain_error(err),
    };

    let events = match state
        .backend
        .chat_stream(&prepared.model, &prepared.history)
        .await
    {
        Ok(events) => events,
        Err(err) => return plain_error(ApiError::Upstream(err)),
    };

    let body = Body::from_stream(relay::relay_stream(
        state.storage.clone(),
        prepared.chat_id,
        events,
    ));

    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

// The streaming route reports pre-stream failures as plain text; there is
// no structured error framing once the body has started.
fn plain_error(err: ApiError) -> Response {
    let status = err.status();
    if status.is_server_error() {
        log::error!("streaming request failed: {:#}", err);
    }
    (status, err.to_string()).into_response()
}

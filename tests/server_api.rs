mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::FakeBackend;
use http_body_util::BodyExt;
use ollachat::models::{ChatWithMessages, Role};
use ollachat::ollama::ChatEvent;
use ollachat::server::{router, AppState};
use ollachat::storage::StorageManager;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

async fn app_with(backend: Arc<FakeBackend>) -> (Router, Arc<StorageManager>) {
    let storage = Arc::new(StorageManager::in_memory().await.unwrap());
    let app = router(AppState {
        storage: storage.clone(),
        backend,
    });
    (app, storage)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(request(method, uri, body))
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn call_json(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, bytes) = call(app, method, uri, body).await;
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn seed_chat(app: &Router, title: &str) -> ChatWithMessages {
    let (status, value) =
        call_json(app, "POST", "/api/chats", Some(json!({ "title": title }))).await;
    assert_eq!(status, StatusCode::CREATED);
    serde_json::from_value(value).unwrap()
}

fn generation_body(chat_id: &str, content: &str) -> Value {
    json!({
        "chatId": chat_id,
        "model": "llama3",
        "messages": [{ "role": "USER", "content": content }],
    })
}

#[tokio::test]
async fn stream_rejects_missing_fields_with_plain_text_400() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let (status, bytes) = call(&app, "POST", "/api/chat/stream", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        "chatId, model and messages are required"
    );
}

#[tokio::test]
async fn completion_rejects_missing_fields_with_json_400() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let (status, value) = call_json(
        &app,
        "POST",
        "/api/chat/completion",
        Some(json!({ "model": "llama3" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        value["message"],
        json!("chatId, model and messages are required")
    );
}

#[tokio::test]
async fn generation_against_an_unknown_chat_is_404() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let body = generation_body(&Uuid::new_v4().to_string(), "hi");
    let (status, _) = call(&app, "POST", "/api/chat/stream", Some(body.clone())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, value) = call_json(&app, "POST", "/api/chat/completion", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["message"], json!("chat not found"));
}

#[tokio::test]
async fn streaming_forwards_deltas_in_order_and_persists_the_answer() {
    let backend = Arc::new(FakeBackend::hello());
    let (app, storage) = app_with(backend.clone()).await;
    let chat = seed_chat(&app, "greeting").await;

    let (status, bytes) = call(
        &app,
        "POST",
        "/api/chat/stream",
        Some(generation_body(&chat.chat.id.to_string(), "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(bytes).unwrap(), "Hello");

    let messages = storage.list_messages(chat.chat.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[0].content, "Hello");

    // The submitted history reaches the service with lowercase roles.
    let history = backend.last_history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "hi");
}

#[tokio::test]
async fn a_stream_ending_without_done_persists_nothing() {
    let backend = Arc::new(FakeBackend::streaming(vec![ChatEvent::Content(
        "partial".to_string(),
    )]));
    let (app, storage) = app_with(backend).await;
    let chat = seed_chat(&app, "interrupted").await;

    let (status, bytes) = call(
        &app,
        "POST",
        "/api/chat/stream",
        Some(generation_body(&chat.chat.id.to_string(), "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(String::from_utf8(bytes).unwrap(), "partial");
    assert!(storage.list_messages(chat.chat.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn an_upstream_error_aborts_the_body_and_persists_nothing() {
    let mut backend = FakeBackend::streaming(vec![ChatEvent::Content("par".to_string())]);
    backend.error_mid_stream = true;
    let (app, storage) = app_with(Arc::new(backend)).await;
    let chat = seed_chat(&app, "flaky").await;

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/chat/stream",
            Some(generation_body(&chat.chat.id.to_string(), "hi")),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.into_body().collect().await.is_err());
    assert!(storage.list_messages(chat.chat.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn completion_returns_and_persists_the_full_answer() {
    let backend = Arc::new(FakeBackend::completing("full answer"));
    let (app, storage) = app_with(backend).await;
    let chat = seed_chat(&app, "sync").await;

    let (status, value) = call_json(
        &app,
        "POST",
        "/api/chat/completion",
        Some(generation_body(&chat.chat.id.to_string(), "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["content"], json!("full answer"));

    let messages = storage.list_messages(chat.chat.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id.to_string(), value["messageId"].as_str().unwrap());
    assert_eq!(messages[0].content, "full answer");
}

#[tokio::test]
async fn regeneration_deletes_the_original_and_submits_history_without_it() {
    let backend = Arc::new(FakeBackend::completing("take two"));
    let (app, storage) = app_with(backend.clone()).await;
    let chat = seed_chat(&app, "redo").await;
    let chat_id = chat.chat.id;

    let (status, _) = call_json(
        &app,
        "POST",
        "/api/messages",
        Some(json!({ "chatId": chat_id, "role": "USER", "content": "question" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, stale) = call_json(
        &app,
        "POST",
        "/api/messages",
        Some(json!({ "chatId": chat_id, "role": "ASSISTANT", "content": "take one" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let body = json!({
        "chatId": chat_id,
        "model": "llama3",
        "messages": [{ "role": "USER", "content": "question" }],
        "regenerate": true,
        "originalMessageId": stale["id"],
    });
    let (status, value) = call_json(&app, "POST", "/api/chat/completion", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["content"], json!("take two"));

    let messages = storage.list_messages(chat_id).await.unwrap();
    let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["question", "take two"]);

    let history = backend.last_history().unwrap();
    assert!(history.iter().all(|m| m.content != "take one"));
}

#[tokio::test]
async fn model_listing_degrades_to_an_empty_list() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let (status, value) = call_json(&app, "GET", "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = value["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, ["llama3:latest", "mistral"]);

    let (app, _storage) = app_with(Arc::new(FakeBackend::without_models())).await;
    let (status, value) = call_json(&app, "GET", "/api/models", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["models"], json!([]));
    assert!(value["error"].is_string());
}

#[tokio::test]
async fn chats_crud_covers_archive_rename_and_cascade_delete() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let chat = seed_chat(&app, "to archive").await;
    let id = chat.chat.id;

    // Rename.
    let (status, value) = call_json(
        &app,
        "PATCH",
        &format!("/api/chats/{}", id),
        Some(json!({ "title": "renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["title"], json!("renamed"));

    // Archive hides it from the default listing.
    let (status, _) = call_json(
        &app,
        "PATCH",
        &format!("/api/chats/{}", id),
        Some(json!({ "archived": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, listed) = call_json(&app, "GET", "/api/chats", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 0);
    let (_, listed) = call_json(&app, "GET", "/api/chats?includeArchived=true", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Unarchive restores it.
    let (status, _) = call_json(
        &app,
        "PATCH",
        &format!("/api/chats/{}", id),
        Some(json!({ "archived": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (_, listed) = call_json(&app, "GET", "/api/chats", None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    // Messages ride along in the returned shape.
    let (status, _) = call_json(
        &app,
        "POST",
        "/api/messages",
        Some(json!({ "chatId": id, "role": "USER", "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, fetched) = call_json(&app, "GET", &format!("/api/chats/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["messages"].as_array().unwrap().len(), 1);

    // Deletion cascades and later lookups 404.
    let (status, value) = call_json(&app, "DELETE", &format!("/api/chats/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(value["message"], json!("chat deleted"));
    let (status, _) = call_json(&app, "GET", &format!("/api/chats/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, messages) = call_json(
        &app,
        "GET",
        &format!("/api/messages?chatId={}", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(messages, json!([]));
}

#[tokio::test]
async fn selecting_a_missing_chat_returns_not_found() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let (status, value) = call_json(
        &app,
        "GET",
        &format!("/api/chats/{}", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(value["message"], json!("chat not found"));

    // A non-UUID identifier cannot name a chat either.
    let (status, _) = call_json(&app, "GET", "/api/chats/not-a-real-id", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn message_creation_validates_role_and_touches_the_chat() {
    let (app, _storage) = app_with(Arc::new(FakeBackend::hello())).await;
    let chat = seed_chat(&app, "validation").await;
    let id = chat.chat.id;

    let (status, value) = call_json(&app, "POST", "/api/messages", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(value["message"], json!("chatId, role and content are required"));

    let (status, _) = call_json(
        &app,
        "POST",
        "/api/messages",
        Some(json!({ "chatId": id, "role": "ROBOT", "content": "beep" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call_json(
        &app,
        "POST",
        "/api/messages",
        Some(json!({ "chatId": Uuid::new_v4(), "role": "USER", "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (status, message) = call_json(
        &app,
        "POST",
        "/api/messages",
        Some(json!({ "chatId": id, "role": "USER", "content": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["role"], json!("USER"));

    let (_, fetched) = call_json(&app, "GET", &format!("/api/chats/{}", id), None).await;
    let updated_at =
        chrono::DateTime::parse_from_rfc3339(fetched["updatedAt"].as_str().unwrap()).unwrap();
    let created_at =
        chrono::DateTime::parse_from_rfc3339(fetched["createdAt"].as_str().unwrap()).unwrap();
    assert!(updated_at > created_at);

    let (status, _) = call_json(
        &app,
        "GET",
        "/api/messages",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

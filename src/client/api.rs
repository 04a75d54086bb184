use crate::models::{
    ChatMessage, ChatUpdate, ChatWithMessages, GenerationRequest, HistoryMessage, Role,
};
use crate::ollama::ModelInfo;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use std::pin::Pin;
use uuid::Uuid;

// Alias for the raw chunked response body of a streamed generation.
pub type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

/// Result of the completion endpoint.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub content: String,
    pub message_id: Uuid,
}

/// Result of the model-listing endpoint. `models` may be empty when the
/// generation service is unreachable; `error` says why.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ModelListing {
    pub models: Vec<ModelInfo>,
    pub error: Option<String>,
}

/// HTTP client for the chat server. Every call funnels through one
/// error-normalizing path: non-success responses have their `{message}`
/// body extracted and surfaced as a plain error.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api{}", self.base_url, endpoint)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        Err(Self::error_message(response).await)
    }

    // Mirrors the server's `{message}` error bodies; anything else falls
    // back to a generic status line.
    async fn error_message(response: reqwest::Response) -> anyhow::Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                value
                    .get("message")
                    .and_then(|message| message.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("HTTP error! status: {}", status)
                } else {
                    body.trim().to_string()
                }
            });
        log::error!("API call failed ({}): {}", status, message);
        anyhow!(message)
    }

    pub async fn list_chats(&self, include_archived: bool) -> Result<Vec<ChatWithMessages>> {
        let mut request = self.http.get(self.url("/chats"));
        if include_archived {
            request = request.query(&[("includeArchived", "true")]);
        }
        let response = Self::check(request.send().await.context("Failed to reach the server")?)
            .await?;
        response.json().await.context("Failed to decode chat list")
    }

    pub async fn get_chat(&self, chat_id: Uuid) -> Result<ChatWithMessages> {
        let response = self
            .http
            .get(self.url(&format!("/chats/{}", chat_id)))
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        response.json().await.context("Failed to decode chat")
    }

    pub async fn create_chat(&self, title: Option<&str>) -> Result<ChatWithMessages> {
        let response = self
            .http
            .post(self.url("/chats"))
            .json(&json!({ "title": title }))
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        response.json().await.context("Failed to decode new chat")
    }

    pub async fn update_chat(&self, chat_id: Uuid, update: &ChatUpdate) -> Result<ChatWithMessages> {
        let response = self
            .http
            .patch(self.url(&format!("/chats/{}", chat_id)))
            .json(update)
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .context("Failed to decode updated chat")
    }

    pub async fn delete_chat(&self, chat_id: Uuid) -> Result<()> {
        let response = self
            .http
            .delete(self.url(&format!("/chats/{}", chat_id)))
            .send()
            .await
            .context("Failed to reach the server")?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn create_message(
        &self,
        chat_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ChatMessage> {
        let response = self
            .http
            .post(self.url("/messages"))
            .json(&json!({
                "chatId": chat_id,
                "role": role,
                "content": content,
            }))
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        response.json().await.context("Failed to decode message")
    }

    pub async fn list_models(&self) -> Result<ModelListing> {
        let response = self
            .http
            .get(self.url("/models"))
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .context("Failed to decode model listing")
    }

    pub async fn completion(&self, request: &GenerationRequest) -> Result<CompletionResponse> {
        let response = self
            .http
            .post(self.url("/chat/completion"))
            .json(request)
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        response
            .json()
            .await
            .context("Failed to decode completion")
    }

    /// Starts a streamed generation. The returned stream yields the raw
    /// chunked body: plain content deltas, no framing.
    pub async fn stream_chat(
        &self,
        chat_id: Uuid,
        model: &str,
        history: Vec<HistoryMessage>,
    ) -> Result<ByteStream> {
        let request = GenerationRequest {
            chat_id: Some(chat_id.to_string()),
            model: Some(model.to_string()),
            messages: Some(history),
            regenerate: false,
            original_message_id: None,
        };
        let response = self
            .http
            .post(self.url("/chat/stream"))
            .json(&request)
            .send()
            .await
            .context("Failed to reach the server")?;
        let response = Self::check(response).await?;
        Ok(Box::pin(response.bytes_stream()))
    }
}

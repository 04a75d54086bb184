#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ollachat::ollama::{ChatEvent, ChatEventStream, GenerationBackend, ModelInfo, OllamaMessage};
use std::sync::Mutex;

/// A scripted generation backend: replays a fixed event sequence for
/// streaming calls, returns a fixed string for completions, and records
/// the history submitted by the most recent call.
pub struct FakeBackend {
    pub events: Vec<ChatEvent>,
    pub error_mid_stream: bool,
    pub completion: String,
    pub models: Option<Vec<ModelInfo>>,
    history: Mutex<Option<Vec<OllamaMessage>>>,
}

impl FakeBackend {
    pub fn streaming(events: Vec<ChatEvent>) -> Self {
        Self {
            events,
            error_mid_stream: false,
            completion: "Hello".to_string(),
            models: Some(vec![model("llama3:latest"), model("mistral")]),
            history: Mutex::new(None),
        }
    }

    /// The documented example stream: "He", "llo", done.
    pub fn hello() -> Self {
        Self::streaming(vec![
            ChatEvent::Content("He".to_string()),
            ChatEvent::Content("llo".to_string()),
            ChatEvent::Done,
        ])
    }

    pub fn completing(content: &str) -> Self {
        let mut backend = Self::hello();
        backend.completion = content.to_string();
        backend
    }

    pub fn without_models() -> Self {
        let mut backend = Self::hello();
        backend.models = None;
        backend
    }

    pub fn last_history(&self) -> Option<Vec<OllamaMessage>> {
        self.history.lock().unwrap().clone()
    }

    fn record(&self, messages: &[OllamaMessage]) {
        *self.history.lock().unwrap() = Some(messages.to_vec());
    }
}

pub fn model(name: &str) -> ModelInfo {
    ModelInfo {
        name: name.to_string(),
        size: 4_000_000_000,
        modified_at: "2025-01-01T00:00:00Z".to_string(),
        digest: "sha256:0000".to_string(),
    }
}

#[async_trait]
impl GenerationBackend for FakeBackend {
    async fn chat_stream(
        &self,
        _model: &str,
        messages: &[OllamaMessage],
    ) -> Result<ChatEventStream> {
        self.record(messages);
        let mut items: Vec<Result<ChatEvent>> = self.events.iter().cloned().map(Ok).collect();
        if self.error_mid_stream {
            items.push(Err(anyhow!("connection reset by peer")));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }

    async fn chat(&self, _model: &str, messages: &[OllamaMessage]) -> Result<String> {
        self.record(messages);
        Ok(self.completion.clone())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        self.models
            .clone()
            .ok_or_else(|| anyhow!("generation service offline"))
    }
}

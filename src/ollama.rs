use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

// Alias for the stream of decoded generation events.
pub type ChatEventStream = Pin<Box<dyn Stream<Item = Result<ChatEvent>> + Send>>;

/// One decoded event of a streaming generation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// An incremental fragment of generated text.
    Content(String),
    /// The terminal marker; everything after it is ignored.
    Done,
}

/// A message in the shape the generation service expects (lowercase role).
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct OllamaMessage {
    pub role: String,
    pub content: String,
}

/// One entry of the service's model listing.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub digest: String,
}

// Trait defining the interface to the generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Starts a streaming generation and returns the decoded event stream.
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[OllamaMessage],
    ) -> Result<ChatEventStream>;

    /// Runs a generation to completion and returns the full content.
    async fn chat(&self, model: &str, messages: &[OllamaMessage]) -> Result<String>;

    /// Lists the models the service currently serves.
    async fn list_models(&self) -> Result<Vec<ModelInfo>>;
}

// --- Wire types of the Ollama chat protocol ---

#[derive(Serialize, Debug)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [OllamaMessage],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct StreamFrame {
    #[serde(default)]
    message: Option<FrameMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize, Debug)]
struct FrameMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize, Debug)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Incremental decoder for the newline-delimited JSON stream. Network
/// chunks may split or merge frames arbitrarily, so bytes are buffered
/// until a newline completes a line; the trailing partial line is kept
/// for the next chunk. Blank lines and lines that fail to parse are
/// protocol noise and are dropped.
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    pending: Vec<u8>,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one network chunk, returning the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ChatEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            Self::decode_line(&line[..pos], &mut events);
        }
        events
    }

    /// Flushes the buffered remainder once the upstream body has ended.
    pub fn finish(&mut self) -> Vec<ChatEvent> {
        let pending = std::mem::take(&mut self.pending);
        let mut events = Vec::new();
        Self::decode_line(&pending, &mut events);
        events
    }

    fn decode_line(line: &[u8], events: &mut Vec<ChatEvent>) {
        let line = line.trim_ascii();
        if line.is_empty() {
            return;
        }
        match serde_json::from_slice::<StreamFrame>(line) {
            Ok(frame) => {
                if let Some(message) = frame.message {
                    if !message.content.is_empty() {
                        events.push(ChatEvent::Content(message.content));
                    }
                }
                if frame.done {
                    events.push(ChatEvent::Done);
                }
            }
            Err(err) => {
                log::debug!("Skipping undecodable stream line: {}", err);
            }
        }
    }
}

/// Client for an Ollama-compatible generation service.
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn send_chat(
        &self,
        model: &str,
        messages: &[OllamaMessage],
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/chat", self.base_url);
        log::info!(
            "Sending chat request to {} (model: {}, stream: {})",
            url,
            model,
            stream
        );

        let response = self
            .client
            .post(&url)
            .json(&OllamaChatRequest {
                model,
                messages,
                stream,
            })
            .send()
            .await
            .context("Failed to reach the generation service")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read error body>".to_string());
            log::error!("Generation service returned {}: {}", status, body);
            anyhow::bail!("generation service returned {}: {}", status, body);
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[OllamaMessage],
    ) -> Result<ChatEventStream> {
        let response = self.send_chat(model, messages, true).await?;
        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = NdjsonDecoder::new();

        let events = async_stream::try_stream! {
            while let Some(chunk) = body.next().await {
                let chunk = chunk.context("Error reading the generation stream")?;
                for event in decoder.feed(&chunk) {
                    yield event;
                }
            }
            for event in decoder.finish() {
                yield event;
            }
        };

        Ok(Box::pin(events))
    }

    async fn chat(&self, model: &str, messages: &[OllamaMessage]) -> Result<String> {
        #[derive(Deserialize)]
        struct ChatCompletion {
            message: FrameMessage,
        }

        let response = self.send_chat(model, messages, false).await?;
        let completion: ChatCompletion = response
            .json()
            .await
            .context("Failed to decode the generation response")?;
        Ok(completion.message.content)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = format!("{}/api/tags", self.base_url);
        log::debug!("Fetching model list from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach the generation service")?;

        if !response.status().is_success() {
            anyhow::bail!("model listing returned {}", response.status());
        }

        let tags: TagsResponse = response
            .json()
            .await
            .context("Failed to decode the model listing")?;
        Ok(tags.models)
    }
}

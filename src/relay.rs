use crate::error::ApiError;
use crate::models::{ChatMessage, GenerationRequest, Role};
use crate::ollama::{ChatEvent, ChatEventStream, GenerationBackend, OllamaMessage};
use crate::storage::StorageManager;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use uuid::Uuid;

/// A validated generation request: the chat exists, any regeneration
/// delete has been applied, and the history is in service vocabulary.
#[derive(Debug)]
pub struct PreparedGeneration {
    pub chat_id: Uuid,
    pub model: String,
    pub history: Vec<OllamaMessage>,
}

/// Validates a generation request against the record store. Shared by the
/// streaming and completion endpoints: both have identical validation and
/// regeneration semantics.
pub async fn prepare(
    storage: &StorageManager,
    request: GenerationRequest,
) -> Result<PreparedGeneration, ApiError> {
    let (Some(chat_id), Some(model), Some(messages)) =
        (request.chat_id, request.model, request.messages)
    else {
        return Err(ApiError::MissingParameter(
            "chatId, model and messages are required".to_string(),
        ));
    };

    // An unparseable identifier cannot name an existing chat.
    let Ok(chat_id) = Uuid::parse_str(&chat_id) else {
        return Err(ApiError::chat_not_found());
    };
    if storage
        .get_chat(chat_id)
        .await
        .map_err(ApiError::Internal)?
        .is_none()
    {
        return Err(ApiError::chat_not_found());
    }

    // Regeneration discards the named previous answer first. The delete is
    // not transactional with the new generation.
    if request.regenerate {
        if let Some(raw) = request.original_message_id {
            let Ok(original_id) = Uuid::parse_str(&raw) else {
                return Err(ApiError::MissingParameter(format!(
                    "invalid originalMessageId: {}",
                    raw
                )));
            };
            log::info!(
                "Regeneration for chat {}: deleting message {}",
                chat_id,
                original_id
            );
            storage
                .delete_message(original_id)
                .await
                .map_err(ApiError::Internal)?;
        }
    }

    let history = messages
        .into_iter()
        .map(|message| OllamaMessage {
            role: message.role.ollama_name().to_string(),
            content: message.content,
        })
        .collect();

    Ok(PreparedGeneration {
        chat_id,
        model,
        history,
    })
}

/// Runs the non-streaming generation flow: full completion, persisted as
/// one ASSISTANT message.
pub async fn complete(
    storage: &StorageManager,
    backend: &dyn GenerationBackend,
    request: GenerationRequest,
) -> Result<ChatMessage, ApiError> {
    let prepared = prepare(storage, request).await?;
    let content = backend
        .chat(&prepared.model, &prepared.history)
        .await
        .map_err(ApiError::Upstream)?;

    let message = storage
        .create_message(prepared.chat_id, Role::Assistant, &content)
        .await
        .map_err(ApiError::Internal)?;
    log::info!(
        "Persisted completion {} ({} chars) for chat {}",
        message.id,
        message.content.len(),
        prepared.chat_id
    );
    Ok(message)
}

/// The relay loop. Forwards every content delta to the output stream in
/// arrival order while accumulating it; when the terminal `done` event
/// arrives, persists the accumulated answer as one ASSISTANT message
/// (which also bumps the chat's timestamp) and closes the stream. If the
/// upstream ends without `done`, the stream closes with nothing persisted.
/// Upstream errors terminate the stream with an error; bytes already
/// forwarded stay forwarded.
pub fn relay_stream(
    storage: Arc<StorageManager>,
    chat_id: Uuid,
    mut events: ChatEventStream,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::try_stream! {
        let mut accumulated = String::new();

        while let Some(event) = events.next().await {
            match event {
                Ok(ChatEvent::Content(delta)) => {
                    accumulated.push_str(&delta);
                    yield Bytes::from(delta);
                }
                Ok(ChatEvent::Done) => {
                    let message = storage
                        .create_message(chat_id, Role::Assistant, &accumulated)
                        .await
                        .map_err(to_io_error)?;
                    log::info!(
                        "Persisted streamed answer {} ({} chars) for chat {}",
                        message.id,
                        accumulated.len(),
                        chat_id
                    );
                    return;
                }
                Err(err) => {
                    log::error!("Upstream error while streaming for chat {}: {:#}", chat_id, err);
                    Err(to_io_error(err))?;
                }
            }
        }

        log::warn!(
            "Generation stream for chat {} ended without done; nothing persisted",
            chat_id
        );
    }
}

fn to_io_error(err: anyhow::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", err))
}

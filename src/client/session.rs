use crate::client::api::ApiClient;
use crate::client::prefs::ClientPrefs;
use crate::models::{
    derive_title, ChatMessage, ChatUpdate, ChatWithMessages, GenerationRequest, HistoryMessage,
    Role,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Shown when the model listing cannot be fetched at all.
pub const FALLBACK_MODELS: &[&str] = &["llama2", "codellama", "mistral"];
const DEFAULT_MODEL: &str = "llama3:latest";

// Everything observable about the session. Owned by the store; only ever
// touched between I/O suspension points, under the one mutex.
struct SessionState {
    chats: Vec<ChatWithMessages>,
    current: Option<ChatWithMessages>,
    /// Snapshot of the in-flight response text, present only while a
    /// generation streams for the active chat. Never persisted.
    streaming: Option<String>,
    generating: bool,
    last_error: Option<String>,
    selected_model: String,
    available_models: Vec<String>,
    prefs: ClientPrefs,
}

/// The conversation state store plus the stream consumer: owns the list
/// of chats, the active selection, the streaming buffer, and the single
/// generation-in-flight guard.
pub struct ChatStore {
    api: ApiClient,
    state: Arc<Mutex<SessionState>>,
}

impl ChatStore {
    pub fn new(api: ApiClient, prefs: ClientPrefs) -> Self {
        Self {
            api,
            state: Arc::new(Mutex::new(SessionState {
                chats: Vec::new(),
                current: None,
                streaming: None,
                generating: false,
                last_error: None,
                selected_model: DEFAULT_MODEL.to_string(),
                available_models: Vec::new(),
                prefs,
            })),
        }
    }

    // --- Accessors ---

    pub async fn chats(&self) -> Vec<ChatWithMessages> {
        self.state.lock().await.chats.clone()
    }

    pub async fn current_chat(&self) -> Option<ChatWithMessages> {
        self.state.lock().await.current.clone()
    }

    pub async fn streaming_message(&self) -> Option<String> {
        self.state.lock().await.streaming.clone()
    }

    pub async fn is_generating(&self) -> bool {
        self.state.lock().await.generating
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn clear_error(&self) {
        self.state.lock().await.last_error = None;
    }

    pub async fn selected_model(&self) -> String {
        self.state.lock().await.selected_model.clone()
    }

    pub async fn available_models(&self) -> Vec<String> {
        self.state.lock().await.available_models.clone()
    }

    // Records a failure as user-visible transient state, leaving prior
    // state intact.
    async fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.state.lock().await.last_error = Some(format!("{:#}", err));
        }
        result
    }

    // --- Models ---

    /// Refreshes the available-model list, falling back to a built-in
    /// default set when the server cannot be reached.
    pub async fn refresh_models(&self) {
        match self.api.list_models().await {
            Ok(listing) => {
                if let Some(error) = &listing.error {
                    log::warn!("Model listing degraded: {}", error);
                }
                let names = listing.models.into_iter().map(|m| m.name).collect();
                self.state.lock().await.available_models = names;
            }
            Err(err) => {
                log::error!("Failed to fetch available models: {:#}", err);
                self.state.lock().await.available_models =
                    FALLBACK_MODELS.iter().map(|s| s.to_string()).collect();
            }
        }
    }

    /// Remembers the model for subsequent chats and applies it to the
    /// current one, if any.
    pub async fn set_model(&self, model: &str) -> Result<()> {
        let has_current = {
            let mut s = self.state.lock().await;
            s.selected_model = model.to_string();
            s.current.is_some()
        };
        if has_current {
            self.change_model(model).await
        } else {
            Ok(())
        }
    }

    /// Persists a model change on the current chat.
    pub async fn change_model(&self, model: &str) -> Result<()> {
        let result = async {
            let Some(chat_id) = self.state.lock().await.current.as_ref().map(|c| c.chat.id)
            else {
                bail!("no chat selected");
            };
            let update = ChatUpdate {
                model: Some(model.to_string()),
                ..Default::default()
            };
            let updated = self.api.update_chat(chat_id, &update).await?;
            self.replace_chat(updated).await;
            Ok(())
        }
        .await;
        self.record(result).await
    }

    // --- Chat actions ---

    /// Loads the non-archived chat list. When nothing is selected and the
    /// user did not explicitly close a chat, auto-selects the remembered
    /// last-active chat if it still exists, else the first of the list.
    pub async fn load_chats(&self) -> Result<()> {
        let result = self.load_chats_inner().await;
        self.record(result).await
    }

    async fn load_chats_inner(&self) -> Result<()> {
        let listed = self.api.list_chats(false).await?;
        let active: Vec<ChatWithMessages> =
            listed.into_iter().filter(|c| !c.chat.archived).collect();

        let candidate = {
            let mut s = self.state.lock().await;
            let skip = s.current.is_some() || active.is_empty() || s.prefs.closed_by_user();
            let candidate = if skip {
                None
            } else {
                match s.prefs.last_selected_chat() {
                    Some(remembered) if active.iter().any(|c| c.chat.id == remembered) => {
                        Some(remembered)
                    }
                    Some(_) => {
                        // The remembered chat is gone; forget it.
                        s.prefs.forget_chat();
                        Some(active[0].chat.id)
                    }
                    None => Some(active[0].chat.id),
                }
            };
            s.chats = active;
            candidate
        };

        if let Some(chat_id) = candidate {
            log::info!("Auto-selecting chat {}", chat_id);
            let detail = self.api.get_chat(chat_id).await?;
            let mut s = self.state.lock().await;
            s.prefs.remember_chat(chat_id);
            s.current = Some(detail);
        }
        Ok(())
    }

    /// Fetches the full chat and makes it the active one. On failure
    /// (e.g. the chat does not exist) the previous selection stays.
    pub async fn select_chat(&self, chat_id: Uuid) -> Result<()> {
        let result = async {
            let detail = self.api.get_chat(chat_id).await?;
            let mut s = self.state.lock().await;
            if s.current.as_ref().map(|c| c.chat.id) != Some(chat_id) {
                // Navigating away from the chat an in-flight buffer
                // belongs to discards its view.
                s.streaming = None;
            }
            s.current = Some(detail);
            s.prefs.set_closed_by_user(false);
            s.prefs.remember_chat(chat_id);
            Ok(())
        }
        .await;
        self.record(result).await
    }

    /// Deselects without deleting. The explicit close is remembered so the
    /// next load does not re-open anything automatically.
    pub async fn close_chat(&self) {
        log::info!("Closing the current chat");
        let mut s = self.state.lock().await;
        s.current = None;
        s.streaming = None;
        s.prefs.set_closed_by_user(true);
        s.prefs.forget_chat();
    }

    pub async fn create_chat(&self, title: Option<&str>) -> Result<ChatWithMessages> {
        let result = async {
            let chat = self.api.create_chat(title).await?;
            let mut s = self.state.lock().await;
            s.chats.insert(0, chat.clone());
            s.current = Some(chat.clone());
            s.prefs.set_closed_by_user(false);
            s.prefs.remember_chat(chat.chat.id);
            Ok(chat)
        }
        .await;
        self.record(result).await
    }

    pub async fn delete_chat(&self, chat_id: Uuid) -> Result<()> {
        let result = async {
            self.api.delete_chat(chat_id).await?;
            let mut s = self.state.lock().await;
            s.chats.retain(|c| c.chat.id != chat_id);
            if s.current.as_ref().map(|c| c.chat.id) == Some(chat_id) {
                s.current = None;
                s.streaming = None;
            }
            if s.prefs.last_selected_chat() == Some(chat_id) {
                s.prefs.forget_chat();
            }
            Ok(())
        }
        .await;
        self.record(result).await
    }

    pub async fn rename_chat(&self, chat_id: Uuid, title: &str) -> Result<()> {
        let result = async {
            if title.trim().is_empty() {
                bail!("title cannot be empty");
            }
            let update = ChatUpdate {
                title: Some(title.trim().to_string()),
                ..Default::default()
            };
            let updated = self.api.update_chat(chat_id, &update).await?;
            self.replace_chat(updated).await;
            Ok(())
        }
        .await;
        self.record(result).await
    }

    /// Archives a chat: it leaves the active list, and the selection is
    /// cleared if it was the active one.
    pub async fn archive_chat(&self, chat_id: Uuid) -> Result<()> {
        let result = async {
            let update = ChatUpdate {
                archived: Some(true),
                ..Default::default()
            };
            self.api.update_chat(chat_id, &update).await?;
            let mut s = self.state.lock().await;
            s.chats.retain(|c| c.chat.id != chat_id);
            if s.current.as_ref().map(|c| c.chat.id) == Some(chat_id) {
                s.current = None;
                s.streaming = None;
            }
            Ok(())
        }
        .await;
        self.record(result).await
    }

    pub async fn unarchive_chat(&self, chat_id: Uuid) -> Result<()> {
        let result = async {
            let update = ChatUpdate {
                archived: Some(false),
                ..Default::default()
            };
            let restored = self.api.update_chat(chat_id, &update).await?;
            self.state.lock().await.chats.insert(0, restored);
            Ok(())
        }
        .await;
        self.record(result).await
    }

    /// Fetches the archived chats without touching the active list.
    pub async fn load_archived_chats(&self) -> Result<Vec<ChatWithMessages>> {
        let result = async {
            let listed = self.api.list_chats(true).await?;
            Ok(listed.into_iter().filter(|c| c.chat.archived).collect())
        }
        .await;
        self.record(result).await
    }

    /// Clears the active chat's messages from view only.
    pub async fn clear_messages(&self) {
        if let Some(current) = &mut self.state.lock().await.current {
            current.messages.clear();
        }
    }

    async fn replace_chat(&self, updated: ChatWithMessages) {
        let mut s = self.state.lock().await;
        if let Some(entry) = s.chats.iter_mut().find(|c| c.chat.id == updated.chat.id) {
            *entry = updated.clone();
        }
        if s.current.as_ref().map(|c| c.chat.id) == Some(updated.chat.id) {
            s.current = Some(updated);
        }
    }

    // --- Sending ---

    /// Sends a message and streams the response. Only one generation may
    /// be in flight; the flag is held for the duration of the call. There
    /// is no cancellation: switching chats mid-stream only stops the
    /// response from being shown, not from being generated or persisted.
    pub async fn send_message(&self, content: &str, chat_id: Option<Uuid>) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            bail!("message cannot be empty");
        }
        {
            let mut s = self.state.lock().await;
            if s.generating {
                bail!("a generation is already in progress");
            }
            s.generating = true;
            s.last_error = None;
            s.streaming = Some(String::new());
        }

        let result = self.send_message_inner(content, chat_id).await;

        let mut s = self.state.lock().await;
        s.generating = false;
        s.streaming = None;
        if let Err(err) = &result {
            s.last_error = Some(format!("{:#}", err));
        }
        result
    }

    async fn send_message_inner(&self, content: &str, chat_id: Option<Uuid>) -> Result<()> {
        let target = self.resolve_target(content, chat_id).await?;
        let target_id = target.chat.id;
        log::info!("Sending message to chat {}", target_id);

        // The user's message is persisted before the generation call so it
        // renders (and survives) regardless of how the generation goes.
        let user_message = self
            .api
            .create_message(target_id, Role::User, content)
            .await?;
        {
            let mut s = self.state.lock().await;
            if let Some(current) = &mut s.current {
                if current.chat.id == target_id {
                    current.messages.push(user_message.clone());
                }
            }
        }

        let mut history: Vec<HistoryMessage> = target
            .messages
            .iter()
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        history.push(HistoryMessage {
            role: Role::User,
            content: user_message.content.clone(),
        });

        let model = match &target.chat.model {
            Some(model) => model.clone(),
            None => self.state.lock().await.selected_model.clone(),
        };

        let mut stream = self.api.stream_chat(target_id, &model, history).await?;

        // The streaming buffer. Owned by this call; the lossy snapshot is
        // rebuilt from all bytes so far, so a multi-byte character split
        // across chunks renders correctly once complete.
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading the response stream")?;
            buffer.extend_from_slice(&chunk);
            let snapshot = String::from_utf8_lossy(&buffer).into_owned();
            let mut s = self.state.lock().await;
            if s.current.as_ref().map(|c| c.chat.id) == Some(target_id) {
                s.streaming = Some(snapshot);
            } else {
                s.streaming = None;
            }
        }
        log::debug!(
            "Stream for chat {} finished ({} bytes)",
            target_id,
            buffer.len()
        );
        self.state.lock().await.streaming = None;

        // Reconcile: the relay persisted the answer; re-fetch the
        // authoritative record rather than inventing one locally.
        match self.api.get_chat(target_id).await {
            Ok(fresh) => {
                let mut s = self.state.lock().await;
                if s.current.as_ref().map(|c| c.chat.id) == Some(target_id) {
                    s.current = Some(fresh);
                } else {
                    log::info!(
                        "Chat {} is no longer active; dropping its response from view",
                        target_id
                    );
                }
            }
            Err(err) => {
                // Fall back to a synthetic message so the answer is not
                // lost from view; it gets a durable id on the next reload.
                log::error!("Failed to reload chat {} after streaming: {:#}", target_id, err);
                let synthetic = ChatMessage {
                    id: Uuid::new_v4(),
                    chat_id: target_id,
                    role: Role::Assistant,
                    content: String::from_utf8_lossy(&buffer).into_owned(),
                    created_at: Utc::now(),
                };
                let mut s = self.state.lock().await;
                if s.current.as_ref().map(|c| c.chat.id) == Some(target_id) {
                    if let Some(current) = &mut s.current {
                        current.messages.push(synthetic);
                    }
                }
            }
        }
        Ok(())
    }

    // Resolves the chat a message goes to: an explicit target, the current
    // chat, or a freshly created one titled after the message.
    async fn resolve_target(
        &self,
        content: &str,
        chat_id: Option<Uuid>,
    ) -> Result<ChatWithMessages> {
        if let Some(id) = chat_id {
            let listed = {
                let s = self.state.lock().await;
                s.chats.iter().find(|c| c.chat.id == id).cloned()
            };
            if let Some(found) = listed {
                return Ok(found);
            }
            let fetched = self.api.get_chat(id).await?;
            let mut s = self.state.lock().await;
            if s.current.is_none() {
                s.current = Some(fetched.clone());
            }
            return Ok(fetched);
        }

        if let Some(current) = self.state.lock().await.current.clone() {
            return Ok(current);
        }

        let title = derive_title(content);
        log::info!("No chat selected; creating one titled {:?}", title);
        let created = self.api.create_chat(Some(&title)).await?;
        let model = self.state.lock().await.selected_model.clone();
        let created = match self
            .api
            .update_chat(
                created.chat.id,
                &ChatUpdate {
                    model: Some(model),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(updated) => updated,
            Err(err) => {
                log::warn!(
                    "Could not set the model on chat {}: {:#}",
                    created.chat.id,
                    err
                );
                created
            }
        };

        let mut s = self.state.lock().await;
        s.chats.insert(0, created.clone());
        s.current = Some(created.clone());
        s.prefs.set_closed_by_user(false);
        s.prefs.remember_chat(created.chat.id);
        Ok(created)
    }

    // --- Regeneration ---

    /// Discards the last assistant answer and requests a replacement via
    /// the non-streaming endpoint, which persists it server-side.
    pub async fn regenerate_last_response(&self) -> Result<()> {
        {
            let mut s = self.state.lock().await;
            if s.generating {
                bail!("a generation is already in progress");
            }
            s.generating = true;
            s.last_error = None;
        }

        let result = self.regenerate_inner().await;

        let mut s = self.state.lock().await;
        s.generating = false;
        if let Err(err) = &result {
            s.last_error = Some(format!("{:#}", err));
        }
        result
    }

    async fn regenerate_inner(&self) -> Result<()> {
        let (chat_id, messages, model) = {
            let s = self.state.lock().await;
            let Some(current) = &s.current else {
                bail!("no chat selected");
            };
            (
                current.chat.id,
                current.messages.clone(),
                current
                    .chat
                    .model
                    .clone()
                    .unwrap_or_else(|| s.selected_model.clone()),
            )
        };

        if messages.len() < 2 {
            bail!("there is no response to regenerate");
        }
        let Some(last_assistant) = messages.iter().rposition(|m| m.role == Role::Assistant)
        else {
            bail!("no assistant response found to regenerate");
        };
        let original_id = messages[last_assistant].id;
        let history: Vec<HistoryMessage> = messages[..last_assistant]
            .iter()
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();

        // Drop the stale answer from view while the replacement streams in.
        {
            let mut s = self.state.lock().await;
            if let Some(current) = &mut s.current {
                if current.chat.id == chat_id {
                    current.messages.truncate(last_assistant);
                }
            }
        }

        let request = GenerationRequest {
            chat_id: Some(chat_id.to_string()),
            model: Some(model),
            messages: Some(history),
            regenerate: true,
            original_message_id: Some(original_id.to_string()),
        };
        let response = self.api.completion(&request).await?;

        // The endpoint already persisted the replacement; surface it with
        // its durable id.
        let replacement = ChatMessage {
            id: response.message_id,
            chat_id,
            role: Role::Assistant,
            content: response.content,
            created_at: Utc::now(),
        };
        let mut s = self.state.lock().await;
        if s.current.as_ref().map(|c| c.chat.id) == Some(chat_id) {
            if let Some(current) = &mut s.current {
                current.messages.push(replacement);
            }
        }
        Ok(())
    }
}

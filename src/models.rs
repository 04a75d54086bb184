use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Who authored a message. Closed set; stored and serialized in its
/// UPPERCASE form, lower-cased only at the generation-service boundary.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::System => "SYSTEM",
        }
    }

    /// Role name in the vocabulary the generation service expects.
    pub fn ollama_name(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "USER" => Ok(Role::User),
            "ASSISTANT" => Ok(Role::Assistant),
            "SYSTEM" => Ok(Role::System),
            other => Err(anyhow::anyhow!("invalid role: {}", other)),
        }
    }
}

// Represents a single message in a chat
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// Represents the metadata for a conversation thread
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chat together with its messages, oldest first. This is the shape the
/// HTTP surface exchanges for every chat-returning operation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ChatWithMessages {
    #[serde(flatten)]
    pub chat: Chat,
    pub messages: Vec<ChatMessage>,
}

/// Partial update applied to a chat. Absent fields are left untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

/// One role/content pair of the history a generation request submits.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

/// Body of the completion and streaming generation endpoints. Required
/// fields are modeled as options so their absence maps to a 400 with a
/// human-readable message instead of a deserialization failure.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<HistoryMessage>>,
    pub regenerate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

/// Derives a chat title from the first message: messages longer than 50
/// characters keep their first 47 followed by an ellipsis.
pub fn derive_title(content: &str) -> String {
    let content = content.trim();
    if content.chars().count() > 50 {
        let head: String = content.chars().take(47).collect();
        format!("{}...", head)
    } else {
        content.to_string()
    }
}

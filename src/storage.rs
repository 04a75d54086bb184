use crate::models::{Chat, ChatMessage, ChatUpdate, ChatWithMessages, Role};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

// Schema. Timestamps are Unix milliseconds; UUIDs are stored as TEXT.
// Message deletion rides on the chat's ON DELETE CASCADE.
const MIGRATIONS_SQL: &str = "
-- Chats Table
CREATE TABLE IF NOT EXISTS chats (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    model TEXT,
    archived INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Messages Table
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    chat_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_messages_chat_id ON messages(chat_id);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
";

const DEFAULT_CHAT_TITLE: &str = "New Chat";

/// The record store: chats and messages over a SQLite pool.
#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        log::info!("Opening database at {}", db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// An ephemeral in-memory store. A single connection keeps every
    /// operation on the same database instance.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Failed to parse in-memory SQLite URL")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Applies the database schema, statement by statement.
    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        log::debug!("Running database migrations");
        for statement in MIGRATIONS_SQL.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(pool)
                .await
                .with_context(|| format!("Failed to run migration statement: {}", statement))?;
        }
        Ok(())
    }

    /// Fetches chats, newest updated first. Archived chats are excluded
    /// unless asked for.
    pub async fn list_chats(&self, include_archived: bool) -> Result<Vec<Chat>> {
        let sql = if include_archived {
            "SELECT id, title, model, archived, created_at, updated_at
             FROM chats ORDER BY updated_at DESC"
        } else {
            "SELECT id, title, model, archived, created_at, updated_at
             FROM chats WHERE archived = 0 ORDER BY updated_at DESC"
        };

        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch chats from database")?;

        let chats = rows
            .iter()
            .map(chat_from_row)
            .collect::<Result<Vec<Chat>>>()?;
        log::debug!("Fetched {} chats", chats.len());
        Ok(chats)
    }

    /// Fetches a single chat by its ID.
    pub async fn get_chat(&self, chat_id: Uuid) -> Result<Option<Chat>> {
        let row = sqlx::query(
            "SELECT id, title, model, archived, created_at, updated_at
             FROM chats WHERE id = ?",
        )
        .bind(chat_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chat from database")?;

        row.as_ref().map(chat_from_row).transpose()
    }

    /// Fetches a chat together with its messages, oldest first.
    pub async fn get_chat_with_messages(&self, chat_id: Uuid) -> Result<Option<ChatWithMessages>> {
        let Some(chat) = self.get_chat(chat_id).await? else {
            return Ok(None);
        };
        let messages = self.list_messages(chat_id).await?;
        Ok(Some(ChatWithMessages { chat, messages }))
    }

    /// Creates a new chat. A missing title falls back to the default one.
    pub async fn create_chat(&self, title: Option<String>, model: Option<String>) -> Result<Chat> {
        let now = Utc::now();
        let chat = Chat {
            id: Uuid::new_v4(),
            title: title.unwrap_or_else(|| DEFAULT_CHAT_TITLE.to_string()),
            model,
            archived: false,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO chats (id, title, model, archived, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(chat.id.to_string())
        .bind(&chat.title)
        .bind(&chat.model)
        .bind(chat.archived)
        .bind(chat.created_at.timestamp_millis())
        .bind(chat.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert new chat into database")?;

        log::info!("Created chat {} ({:?})", chat.id, chat.title);
        Ok(chat)
    }

    /// Applies a partial update and bumps `updated_at`. Returns `None`
    /// when the chat does not exist.
    pub async fn update_chat(&self, chat_id: Uuid, update: &ChatUpdate) -> Result<Option<Chat>> {
        let Some(existing) = self.get_chat(chat_id).await? else {
            return Ok(None);
        };

        let title = update.title.clone().unwrap_or(existing.title);
        let model = update.model.clone().or(existing.model);
        let archived = update.archived.unwrap_or(existing.archived);
        let updated_at = Utc::now();

        sqlx::query(
            "UPDATE chats SET title = ?, model = ?, archived = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&title)
        .bind(&model)
        .bind(archived)
        .bind(updated_at.timestamp_millis())
        .bind(chat_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update chat in database")?;

        log::info!("Updated chat {}", chat_id);
        self.get_chat(chat_id).await
    }

    /// Deletes a chat; its messages go with it via the cascade. Returns
    /// whether a row was actually removed.
    pub async fn delete_chat(&self, chat_id: Uuid) -> Result<bool> {
        log::warn!("Deleting chat {}", chat_id);
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete chat from database")?;
        Ok(result.rows_affected() > 0)
    }

    /// Bumps a chat's `updated_at` to now.
    pub async fn touch_chat(&self, chat_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE chats SET updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp_millis())
            .bind(chat_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update chat timestamp")?;
        Ok(())
    }

    /// Persists a new message and bumps the owning chat's timestamp.
    pub async fn create_message(
        &self,
        chat_id: Uuid,
        role: Role,
        content: &str,
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4(),
            chat_id,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO messages (id, chat_id, role, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(message.chat_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .context("Failed to insert message into database")?;

        self.touch_chat(chat_id).await?;

        log::debug!("Saved {} message {} to chat {}", role, message.id, chat_id);
        Ok(message)
    }

    /// Fetches a chat's messages ordered by creation time ascending.
    /// Same-instant rows keep insertion order via the rowid tie-break.
    pub async fn list_messages(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, chat_id, role, content, created_at
             FROM messages WHERE chat_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(chat_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages from database")?;

        rows.iter().map(message_from_row).collect()
    }

    /// Deletes a single message. Returns whether a row was removed.
    pub async fn delete_message(&self, message_id: Uuid) -> Result<bool> {
        log::info!("Deleting message {}", message_id);
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(message_id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete message from database")?;
        Ok(result.rows_affected() > 0)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn chat_from_row(row: &SqliteRow) -> Result<Chat> {
    Ok(Chat {
        id: parse_uuid(row, "id")?,
        title: row.try_get("title")?,
        model: row.try_get("model")?,
        archived: row.try_get("archived")?,
        created_at: parse_timestamp(row, "created_at")?,
        updated_at: parse_timestamp(row, "updated_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.try_get("role")?;
    Ok(ChatMessage {
        id: parse_uuid(row, "id")?,
        chat_id: parse_uuid(row, "chat_id")?,
        role: role.parse()?,
        content: row.try_get("content")?,
        created_at: parse_timestamp(row, "created_at")?,
    })
}

fn parse_uuid(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.try_get(column)?;
    Uuid::parse_str(&raw).with_context(|| format!("Failed to parse {} as UUID", column))
}

fn parse_timestamp(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>> {
    let millis: i64 = row.try_get(column)?;
    DateTime::from_timestamp_millis(millis).with_context(|| format!("Invalid {} timestamp", column))
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
struct PrefsData {
    last_selected_chat_id: Option<Uuid>,
    chat_closed_by_user: bool,
}

/// Client-side preference persistence: which chat was last active, and
/// whether the user explicitly closed one (so it must not be re-opened on
/// the next load). Writes are best-effort; a failure only loses the
/// pointer, never state.
pub struct ClientPrefs {
    path: PathBuf,
    data: PrefsData,
}

impl ClientPrefs {
    /// Loads preferences from the given file, starting empty when the
    /// file is missing or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                log::warn!("Ignoring malformed prefs file {}: {}", path.display(), err);
                PrefsData::default()
            }),
            Err(_) => PrefsData::default(),
        };
        Self { path, data }
    }

    fn save(&self) {
        let write = || -> anyhow::Result<()> {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let raw = serde_json::to_string_pretty(&self.data)?;
            std::fs::write(&self.path, raw)?;
            Ok(())
        };
        if let Err(err) = write() {
            log::warn!("Failed to persist prefs to {}: {:#}", self.path.display(), err);
        }
    }

    pub fn last_selected_chat(&self) -> Option<Uuid> {
        self.data.last_selected_chat_id
    }

    pub fn remember_chat(&mut self, chat_id: Uuid) {
        self.data.last_selected_chat_id = Some(chat_id);
        self.save();
    }

    pub fn forget_chat(&mut self) {
        self.data.last_selected_chat_id = None;
        self.save();
    }

    pub fn closed_by_user(&self) -> bool {
        self.data.chat_closed_by_user
    }

    pub fn set_closed_by_user(&mut self, closed: bool) {
        self.data.chat_closed_by_user = closed;
        self.save();
    }
}

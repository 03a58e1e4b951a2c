//! Durable storage for the conversation log.
//!
//! [`JsonFileLogStore`] keeps one JSON array per deployment at
//! `{dir}/{deployment_id}.logs.json`. Writes are atomic (temp file + fsync +
//! rename) so a crash mid-save leaves the previous snapshot intact. A file
//! that cannot be parsed is moved aside to `*.logs.json.corrupt` on load,
//! before the next save can replace it.

use super::ConversationTurn;
use crate::error::{CompanionError, Result};
use std::path::PathBuf;
use std::sync::Mutex;

/// Load/save collaborator for [`super::ConversationLog`].
pub trait LogStore: Send + Sync {
    /// Load every stored turn, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Persistence`] when stored data is unreadable.
    fn load(&self) -> Result<Vec<ConversationTurn>>;

    /// Replace the stored turns.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Persistence`] when the write fails.
    fn save(&self, turns: &[ConversationTurn]) -> Result<()>;
}

/// JSON file store keyed by deployment id.
#[derive(Debug, Clone)]
pub struct JsonFileLogStore {
    dir: PathBuf,
    deployment_id: String,
}

impl JsonFileLogStore {
    /// Create a store under `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Persistence`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, deployment_id: impl Into<String>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            CompanionError::Persistence(format!(
                "failed to create log directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            deployment_id: deployment_id.into(),
        })
    }

    /// Path of the log file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(format!("{}.logs.json", self.deployment_id))
    }

    /// Where an unparseable log file is moved on load.
    pub fn corrupt_path(&self) -> PathBuf {
        self.dir.join(format!("{}.logs.json.corrupt", self.deployment_id))
    }
}

impl LogStore for JsonFileLogStore {
    fn load(&self) -> Result<Vec<ConversationTurn>> {
        let path = self.path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path).map_err(|e| {
            CompanionError::Persistence(format!("failed to read {}: {e}", path.display()))
        })?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            let corrupt = self.corrupt_path();
            match std::fs::rename(&path, &corrupt) {
                Ok(()) => CompanionError::Persistence(format!(
                    "failed to parse {}: {e}; moved to {}",
                    path.display(),
                    corrupt.display()
                )),
                Err(rename_err) => CompanionError::Persistence(format!(
                    "failed to parse {}: {e}; could not move it aside: {rename_err}",
                    path.display()
                )),
            }
        })
    }

    fn save(&self, turns: &[ConversationTurn]) -> Result<()> {
        let path = self.path();
        let json = serde_json::to_string(turns).map_err(|e| {
            CompanionError::Persistence(format!("failed to serialize conversation log: {e}"))
        })?;

        let tmp_path = self.dir.join(format!(".{}.logs.tmp", self.deployment_id));
        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| {
            CompanionError::Persistence(format!(
                "failed to write temp file {}: {e}",
                tmp_path.display()
            ))
        })?;

        if let Ok(file) = std::fs::File::open(&tmp_path) {
            let _ = file.sync_all();
        }

        std::fs::rename(&tmp_path, &path).map_err(|e| {
            CompanionError::Persistence(format!(
                "failed to rename temp file to {}: {e}",
                path.display()
            ))
        })
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    turns: Mutex<Vec<ConversationTurn>>,
}

impl MemoryLogStore {
    /// Copy of the currently stored turns.
    pub fn snapshot(&self) -> Vec<ConversationTurn> {
        self.turns.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl LogStore for MemoryLogStore {
    fn load(&self) -> Result<Vec<ConversationTurn>> {
        self.turns
            .lock()
            .map(|t| t.clone())
            .map_err(|_| CompanionError::Persistence("log store lock poisoned".into()))
    }

    fn save(&self, turns: &[ConversationTurn]) -> Result<()> {
        let mut guard = self
            .turns
            .lock()
            .map_err(|_| CompanionError::Persistence("log store lock poisoned".into()))?;
        *guard = turns.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::history::{ConversationLog, TurnMeta, TurnRole};
    use std::sync::Arc;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLogStore::new(dir.path(), "misaki").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileLogStore::new(dir.path(), "misaki").unwrap());

        let mut log = ConversationLog::hydrate(500, store.clone());
        log.append(ConversationTurn::new(TurnRole::User, "hi", TurnMeta::default()));
        log.append(ConversationTurn::new(TurnRole::Assistant, "hey", TurnMeta::default()));

        assert!(dir.path().join("misaki.logs.json").exists());
        assert!(!dir.path().join(".misaki.logs.tmp").exists());

        let reloaded = ConversationLog::hydrate(500, store);
        assert_eq!(reloaded.entries(), log.entries());
    }

    #[test]
    fn deployments_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = JsonFileLogStore::new(dir.path(), "misaki").unwrap();
        let b = JsonFileLogStore::new(dir.path(), "kiri").unwrap();
        a.save(&[ConversationTurn::new(TurnRole::User, "x", TurnMeta::default())])
            .unwrap();
        assert_eq!(a.load().unwrap().len(), 1);
        assert!(b.load().unwrap().is_empty());
    }

    #[test]
    fn corrupt_file_is_a_persistence_error_and_hydrates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLogStore::new(dir.path(), "misaki").unwrap();
        std::fs::write(store.path(), "{not json").unwrap();
        assert!(matches!(store.load(), Err(CompanionError::Persistence(_))));

        let log = ConversationLog::hydrate(10, Arc::new(store));
        assert!(log.is_empty());
    }

    #[test]
    fn corrupt_file_survives_the_next_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileLogStore::new(dir.path(), "misaki").unwrap());
        std::fs::write(store.path(), "[{\"role\": \"user\", trunc").unwrap();

        let mut log = ConversationLog::hydrate(10, store.clone());
        log.append(ConversationTurn::new(TurnRole::User, "fresh", TurnMeta::default()));

        assert_eq!(
            std::fs::read_to_string(store.corrupt_path()).unwrap(),
            "[{\"role\": \"user\", trunc"
        );
        let saved = store.load().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].text, "fresh");
    }

    #[test]
    fn readable_file_is_never_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileLogStore::new(dir.path(), "misaki").unwrap();
        store
            .save(&[ConversationTurn::new(TurnRole::User, "x", TurnMeta::default())])
            .unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
        assert!(!store.corrupt_path().exists());
    }
}

//! Bounded conversation log.
//!
//! The log records every turn for the user and is the only source of the
//! prompt builder's memory window. It is capacity-bounded (oldest entries
//! are evicted first) and persisted through a [`LogStore`] after every
//! mutation. Persistence is best effort: failures are logged and otherwise
//! ignored.

pub mod store;

pub use store::{JsonFileLogStore, LogStore, MemoryLogStore};

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    /// A failed turn; recorded for diagnostics, never fed back as memory.
    Error,
}

/// Optional per-turn metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnMeta {
    /// Backend that produced the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Whether the reply was voiced.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "tts")]
    pub tts_used: Option<bool>,
}

impl TurnMeta {
    fn is_empty(&self) -> bool {
        self.engine.is_none() && self.tts_used.is_none()
    }
}

/// One log record. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: String,
    /// Milliseconds since the Unix epoch.
    #[serde(alias = "ts")]
    pub timestamp: i64,
    pub role: TurnRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "TurnMeta::is_empty")]
    pub meta: TurnMeta,
}

impl ConversationTurn {
    /// Create a turn stamped with a fresh id and the current time.
    pub fn new(role: TurnRole, text: impl Into<String>, meta: TurnMeta) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            role,
            text: text.into(),
            meta,
        }
    }

    /// True for roles that may appear in prompt memory.
    pub fn is_dialogue(&self) -> bool {
        matches!(self.role, TurnRole::User | TurnRole::Assistant)
    }
}

/// Which entry to keep out of a memory window.
///
/// Both strategies describe the same rule (never feed the message being
/// answered back as its own context); callers that know the id of the
/// in-flight turn use [`MemoryExclusion::Id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryExclusion {
    /// Drop the most recent entry.
    Latest,
    /// Drop the entry with this id.
    Id(String),
    /// Exclude nothing (the in-flight message was never logged).
    Nothing,
}

/// Ordered, capacity-bounded turn log.
pub struct ConversationLog {
    entries: Vec<ConversationTurn>,
    capacity: usize,
    enabled: bool,
    store: Option<Arc<dyn LogStore>>,
}

impl std::fmt::Debug for ConversationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLog")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("enabled", &self.enabled)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl ConversationLog {
    /// Create an empty, unpersisted log. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
            enabled: true,
            store: None,
        }
    }

    /// Create a log backed by `store`, loading whatever it already holds.
    ///
    /// A store that fails to load yields an empty log (logged at warn).
    /// Loaded history beyond `capacity` is trimmed oldest-first.
    pub fn hydrate(capacity: usize, store: Arc<dyn LogStore>) -> Self {
        let mut log = Self::new(capacity);
        match store.load() {
            Ok(entries) => {
                debug!("hydrated {} conversation log entries", entries.len());
                log.entries = entries;
                log.evict();
            }
            Err(e) => warn!("conversation log load failed, starting empty: {e}"),
        }
        log.store = Some(store);
        log
    }

    /// Enable or disable recording. Disabled logs ignore appends.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[ConversationTurn] {
        &self.entries
    }

    /// Append a turn, evicting the oldest entries beyond capacity, then persist.
    ///
    /// Returns the id of the appended turn, or `None` when recording is off.
    pub fn append(&mut self, turn: ConversationTurn) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let id = turn.id.clone();
        self.entries.push(turn);
        self.evict();
        self.persist();
        Some(id)
    }

    /// The last `2 * turns` user/assistant entries, oldest first, without
    /// the excluded entry. Never mutates the log.
    pub fn recent(&self, turns: usize, exclusion: &MemoryExclusion) -> Vec<ConversationTurn> {
        let pool: &[ConversationTurn] = match exclusion {
            MemoryExclusion::Latest => {
                let end = self.entries.len().saturating_sub(1);
                &self.entries[..end]
            }
            MemoryExclusion::Id(_) | MemoryExclusion::Nothing => &self.entries,
        };
        let dialogue: Vec<&ConversationTurn> = pool
            .iter()
            .filter(|turn| match exclusion {
                MemoryExclusion::Id(id) => &turn.id != id,
                _ => true,
            })
            .filter(|turn| turn.is_dialogue())
            .collect();
        let keep = turns.saturating_mul(2);
        let start = dialogue.len().saturating_sub(keep);
        dialogue[start..].iter().map(|turn| (*turn).clone()).collect()
    }

    /// Remove every entry and persist the empty log.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    /// Pretty-printed JSON snapshot (2-space indent).
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn export(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    /// Write [`ConversationLog::export`] to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn export_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.export()?)?;
        Ok(())
    }

    fn evict(&mut self) {
        if self.entries.len() > self.capacity {
            let excess = self.entries.len() - self.capacity;
            self.entries.drain(..excess);
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(e) = store.save(&self.entries)
        {
            warn!("conversation log persist failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn turn(role: TurnRole, text: &str) -> ConversationTurn {
        ConversationTurn::new(role, text, TurnMeta::default())
    }

    fn texts(turns: &[ConversationTurn]) -> Vec<&str> {
        turns.iter().map(|t| t.text.as_str()).collect()
    }

    #[test]
    fn append_evicts_oldest_first() {
        let mut log = ConversationLog::new(500);
        for i in 0..520 {
            log.append(turn(TurnRole::User, &format!("m{i}")));
            assert!(log.len() <= 500);
        }
        assert_eq!(log.len(), 500);
        assert_eq!(log.entries()[0].text, "m20");
        assert_eq!(log.entries()[499].text, "m519");
    }

    #[test]
    fn disabled_log_ignores_appends() {
        let mut log = ConversationLog::new(10).with_enabled(false);
        assert_eq!(log.append(turn(TurnRole::User, "hi")), None);
        assert!(log.is_empty());
    }

    #[test]
    fn recent_filters_roles_and_excludes_latest() {
        let mut log = ConversationLog::new(50);
        log.append(turn(TurnRole::User, "hi"));
        log.append(turn(TurnRole::Assistant, "hey"));
        log.append(turn(TurnRole::Error, "boom"));
        log.append(turn(TurnRole::User, "current"));

        let recent = log.recent(10, &MemoryExclusion::Latest);
        assert_eq!(texts(&recent), vec!["hi", "hey"]);
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn recent_excludes_by_id_anywhere() {
        let mut log = ConversationLog::new(50);
        log.append(turn(TurnRole::User, "a"));
        let id = log.append(turn(TurnRole::User, "b")).unwrap();
        log.append(turn(TurnRole::Assistant, "c"));

        let recent = log.recent(10, &MemoryExclusion::Id(id));
        assert_eq!(texts(&recent), vec!["a", "c"]);
    }

    #[test]
    fn recent_window_is_two_entries_per_turn() {
        let mut log = ConversationLog::new(50);
        for i in 0..10 {
            log.append(turn(TurnRole::User, &format!("u{i}")));
            log.append(turn(TurnRole::Assistant, &format!("a{i}")));
        }
        let recent = log.recent(2, &MemoryExclusion::Nothing);
        assert_eq!(texts(&recent), vec!["u8", "a8", "u9", "a9"]);
    }

    #[test]
    fn recent_with_short_history_returns_everything() {
        let mut log = ConversationLog::new(50);
        log.append(turn(TurnRole::User, "only"));
        assert_eq!(texts(&log.recent(50, &MemoryExclusion::Nothing)), vec!["only"]);
        assert!(log.recent(50, &MemoryExclusion::Latest).is_empty());
    }

    #[test]
    fn mutations_persist_and_hydrate() {
        let store = Arc::new(MemoryLogStore::default());
        let mut log = ConversationLog::hydrate(3, store.clone());
        log.append(turn(TurnRole::User, "one"));
        log.append(turn(TurnRole::Assistant, "two"));
        assert_eq!(store.snapshot().len(), 2);

        let reloaded = ConversationLog::hydrate(1, store.clone());
        assert_eq!(texts(reloaded.entries()), vec!["two"]);

        log.clear();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn export_is_pretty_json() {
        let mut log = ConversationLog::new(10);
        log.append(ConversationTurn::new(
            TurnRole::Assistant,
            "hello",
            TurnMeta {
                engine: Some("cloud".into()),
                tts_used: Some(true),
            },
        ));
        let json = log.export().unwrap();
        assert!(json.starts_with("[\n  {"));
        assert!(json.contains("\"ttsUsed\": true"));
        assert!(json.contains("\"role\": \"assistant\""));
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let json = r#"[{"id":"k1","ts":1700000000000,"role":"assistant","text":"hi","meta":{"tts":false}}]"#;
        let turns: Vec<ConversationTurn> = serde_json::from_str(json).unwrap();
        assert_eq!(turns[0].timestamp, 1_700_000_000_000);
        assert_eq!(turns[0].meta.tts_used, Some(false));
    }
}

//! Conversation history: an ordered, append-only turn log persisted through a
//! durable key-value store after every mutation and reloaded at startup.
//!
//! Persistence is fire-and-forget for callers: a failed write is logged and the
//! in-memory sequence stays authoritative for the running session. A malformed
//! persisted payload resets to an empty history instead of propagating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Fixed key under which the serialized conversation is stored.
pub const HISTORY_KEY: &str = "history";

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One side of an exchange. Immutable once created; removed only by a full reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub text: String,
    pub from_user: bool,
    /// Image payload as a data URI, when the user attached one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>, image: Option<String>) -> Self {
        Self {
            text: text.into(),
            from_user: true,
            image,
            timestamp: Utc::now(),
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            from_user: false,
            image: None,
            timestamp: Utc::now(),
        }
    }
}

/// Durable string key-value persistence.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// File-backed store: one JSON file per key under a directory (e.g. ~/.tandem/history.json).
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        std::fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), value)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions. Clones share the same backing map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Ordered turn log with write-through persistence.
pub struct HistoryStore {
    store: Box<dyn KvStore>,
    turns: Vec<Turn>,
}

impl HistoryStore {
    /// Load the persisted sequence if present and well-formed; any read or parse
    /// failure yields an empty sequence.
    pub fn open(store: Box<dyn KvStore>) -> Self {
        let turns = match store.get(HISTORY_KEY) {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(turns) => turns,
                Err(e) => {
                    log::warn!("discarding malformed persisted history: {}", e);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        Self { store, turns }
    }

    /// Append a turn and persist the full sequence. A persistence failure is
    /// logged and swallowed.
    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
        self.persist();
    }

    /// Clear the sequence and persist the empty state. The caller is expected to
    /// have obtained user confirmation.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.persist();
    }

    /// The full ordered sequence, oldest first.
    pub fn all(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn persist(&self) {
        let res = serde_json::to_string(&self.turns)
            .map_err(PersistenceError::from)
            .and_then(|raw| self.store.set(HISTORY_KEY, &raw));
        if let Err(e) = res {
            log::warn!("history persist failed, in-memory state kept: {}", e);
        }
    }
}

//! Bounded conversation history shared between the pipeline and the
//! control surface.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Label used in prompt context lines and the history file.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn: a transcript or a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    /// A user turn stamped with the current time.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// An assistant turn stamped with the current time.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

struct StoreInner {
    turns: VecDeque<Turn>,
    capacity: usize,
}

/// FIFO turn store with a fixed capacity.
///
/// Appending at capacity evicts the oldest turn. Capacity eviction is the
/// only way turns leave the store short of an explicit [`clear`].
///
/// [`clear`]: ConversationStore::clear
pub struct ConversationStore {
    inner: Mutex<StoreInner>,
    persist_path: Option<PathBuf>,
}

impl ConversationStore {
    /// Create an in-memory store holding at most `capacity` turns.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                turns: VecDeque::with_capacity(capacity),
                capacity,
            }),
            persist_path: None,
        }
    }

    /// Create a store backed by a JSON file.
    ///
    /// Existing turns are loaded, keeping the most recent `capacity` when
    /// the file holds more. A missing file starts empty; an unreadable one
    /// logs a warning and starts empty. Writes after that are best-effort.
    #[must_use]
    pub fn with_persistence(capacity: usize, path: PathBuf) -> Self {
        let turns = load_turns(&path, capacity);
        Self {
            inner: Mutex::new(StoreInner { turns, capacity }),
            persist_path: Some(path),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a turn, evicting the oldest if the store is full.
    ///
    /// A zero-capacity store drops every turn.
    pub fn append(&self, turn: Turn) {
        let mut inner = self.lock();
        if inner.capacity == 0 {
            return;
        }
        while inner.turns.len() >= inner.capacity {
            inner.turns.pop_front();
        }
        inner.turns.push_back(turn);
        self.save(&inner.turns);
    }

    /// Change the capacity, evicting oldest turns if the store now holds
    /// too many.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.lock();
        if inner.capacity == capacity {
            return;
        }
        inner.capacity = capacity;
        let mut evicted = false;
        while inner.turns.len() > capacity {
            inner.turns.pop_front();
            evicted = true;
        }
        if evicted {
            self.save(&inner.turns);
        }
    }

    /// All stored turns, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Turn> {
        self.lock().turns.iter().cloned().collect()
    }

    /// Remove every stored turn.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.turns.clear();
        self.save(&inner.turns);
    }

    /// Number of stored turns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().turns.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().turns.is_empty()
    }

    fn save(&self, turns: &VecDeque<Turn>) {
        let Some(path) = self.persist_path.as_deref() else {
            return;
        };
        if let Err(e) = write_turns(path, turns) {
            warn!(path = %path.display(), error = %e, "failed to persist conversation history");
        }
    }
}

fn load_turns(path: &Path, capacity: usize) -> VecDeque<Turn> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return VecDeque::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read conversation history");
            return VecDeque::new();
        }
    };
    match serde_json::from_str::<Vec<Turn>>(&contents) {
        Ok(mut turns) => {
            if turns.len() > capacity {
                turns = turns.split_off(turns.len() - capacity);
            }
            VecDeque::from(turns)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed conversation history, starting empty");
            VecDeque::new()
        }
    }
}

fn write_turns(path: &Path, turns: &VecDeque<Turn>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let turns: Vec<&Turn> = turns.iter().collect();
    let contents = serde_json::to_string_pretty(&turns)?;
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn texts(store: &ConversationStore) -> Vec<String> {
        store.snapshot().into_iter().map(|t| t.text).collect()
    }

    #[test]
    fn append_and_snapshot_in_order() {
        let store = ConversationStore::new(10);
        store.append(Turn::user("first"));
        store.append(Turn::assistant("second"));
        store.append(Turn::user("third"));

        assert_eq!(texts(&store), vec!["first", "second", "third"]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn append_at_capacity_evicts_oldest() {
        let store = ConversationStore::new(4);
        for i in 0..6 {
            store.append(Turn::user(format!("turn {i}")));
        }

        assert_eq!(store.len(), 4);
        assert_eq!(texts(&store), vec!["turn 2", "turn 3", "turn 4", "turn 5"]);
    }

    #[test]
    fn set_capacity_evicts_down_to_new_limit() {
        let store = ConversationStore::new(6);
        for i in 0..6 {
            store.append(Turn::user(format!("turn {i}")));
        }

        store.set_capacity(2);
        assert_eq!(texts(&store), vec!["turn 4", "turn 5"]);
    }

    #[test]
    fn clear_removes_everything() {
        let store = ConversationStore::new(4);
        store.append(Turn::user("hello"));
        store.clear();

        assert!(store.is_empty());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn turn_constructors_set_roles() {
        assert_eq!(Turn::user("q").role, Role::User);
        assert_eq!(Turn::assistant("a").role, Role::Assistant);
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }

    #[test]
    fn persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        {
            let store = ConversationStore::with_persistence(10, path.clone());
            store.append(Turn::user("what time is it"));
            store.append(Turn::assistant("noon"));
        }

        let reloaded = ConversationStore::with_persistence(10, path);
        assert_eq!(texts(&reloaded), vec!["what time is it", "noon"]);
        assert_eq!(reloaded.snapshot()[0].role, Role::User);
    }

    #[test]
    fn load_enforces_capacity_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        {
            let store = ConversationStore::with_persistence(10, path.clone());
            for i in 0..6 {
                store.append(Turn::user(format!("turn {i}")));
            }
        }

        let reloaded = ConversationStore::with_persistence(4, path);
        assert_eq!(
            texts(&reloaded),
            vec!["turn 2", "turn 3", "turn 4", "turn 5"]
        );
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::with_persistence(4, dir.path().join("absent.json"));
        assert!(store.is_empty());
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = ConversationStore::with_persistence(4, path);
        assert!(store.is_empty());
    }

    #[test]
    fn clear_persists_the_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");

        {
            let store = ConversationStore::with_persistence(4, path.clone());
            store.append(Turn::user("gone soon"));
            store.clear();
        }

        let reloaded = ConversationStore::with_persistence(4, path);
        assert!(reloaded.is_empty());
    }
}

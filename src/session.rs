//! Persisted resumption state for an in-progress conversion.
//!
//! A [`Session`] records how far a conversion got: which chunk comes next,
//! the full conversation history the service has accumulated, and every image
//! extracted so far. It is saved before and after each chunk submission, so
//! at any instant the store holds the last durability boundary.
//!
//! The on-disk record is plain JSON with the keys `currentChunk`, `numPages`,
//! `chunkSize`, `chatHistory` and `allImages`, stored under
//! `epub-session-<document name>-<byte size>`.
//!
//! Stores are synchronous: snapshots are small enough that writing them on
//! the orchestrating task is cheaper than coordinating a background writer,
//! and it keeps the before/after ordering trivially correct.

use crate::config::DEFAULT_CHUNK_SIZE;
use crate::error::Pdf2EpubError;
use crate::pipeline::encode::ExtractedImage;
use crate::pipeline::llm::ConversationState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Snapshot of one conversion's progress.
///
/// Chunks `[0, next_chunk_index)` have been acknowledged by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "currentChunk")]
    pub next_chunk_index: usize,
    #[serde(rename = "numPages")]
    pub total_pages: usize,
    /// Pages per chunk of the plan the session was made with. Records
    /// written without it were made with the default.
    #[serde(rename = "chunkSize", default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(rename = "chatHistory")]
    pub conversation: ConversationState,
    #[serde(rename = "allImages", default)]
    pub images: Vec<ExtractedImage>,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// Durable key-value persistence of [`Session`] snapshots.
///
/// Only one conversion per key is ever active, so implementations need no
/// cross-process locking.
pub trait SessionStore: Send + Sync {
    /// Overwrite the entry for `key`. No partial write may be observable.
    fn save(&self, key: &str, session: &Session) -> Result<(), Pdf2EpubError>;

    /// The last saved snapshot. A corrupt entry is removed and reported as
    /// absent.
    fn load(&self, key: &str) -> Result<Option<Session>, Pdf2EpubError>;

    /// Remove the entry; succeeds when there is none.
    fn delete(&self, key: &str) -> Result<(), Pdf2EpubError>;
}

/// One JSON file per key inside a sessions directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data_local_dir>/pdf2epub/sessions`, falling back to the home directory.
    pub fn default_dir() -> Result<PathBuf, Pdf2EpubError> {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|d| d.join("pdf2epub").join("sessions"))
            .ok_or_else(|| Pdf2EpubError::Internal("Could not determine data directory".into()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the JSON file backing `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

fn store_error(key: &str, detail: impl std::fmt::Display) -> Pdf2EpubError {
    Pdf2EpubError::SessionStore {
        key: key.to_string(),
        detail: detail.to_string(),
    }
}

impl SessionStore for FileSessionStore {
    fn save(&self, key: &str, session: &Session) -> Result<(), Pdf2EpubError> {
        fs::create_dir_all(&self.dir).map_err(|e| store_error(key, e))?;
        let path = self.path_for(key);
        let json = serde_json::to_vec(session).map_err(|e| store_error(key, e))?;

        // Atomic write: write to temp, then rename
        let tmp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path).map_err(|e| store_error(key, e))?;
        file.write_all(&json).map_err(|e| store_error(key, e))?;
        file.sync_all().map_err(|e| store_error(key, e))?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|e| store_error(key, e))?;

        debug!(
            "Saved session '{}' at chunk {} ({} bytes)",
            key,
            session.next_chunk_index,
            json.len()
        );
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Session>, Pdf2EpubError> {
        let path = self.path_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error(key, e)),
        };

        match serde_json::from_slice::<Session>(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Discarding unreadable session '{}': {}", key, e);
                self.delete(key)?;
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), Pdf2EpubError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(key, e)),
        }
    }
}

/// In-process store holding serialised snapshots.
///
/// Entries go through the same JSON encoding as [`FileSessionStore`], so a
/// session that survives this store survives the file store too.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store raw text under `key`, bypassing serialisation.
    pub fn insert_raw(&self, key: &str, raw: impl Into<String>) {
        self.lock().insert(key.to_string(), raw.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, key: &str, session: &Session) -> Result<(), Pdf2EpubError> {
        let json = serde_json::to_string(session).map_err(|e| store_error(key, e))?;
        self.lock().insert(key.to_string(), json);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<Session>, Pdf2EpubError> {
        let mut entries = self.lock();
        let Some(raw) = entries.get(key) else {
            return Ok(None);
        };
        match serde_json::from_str::<Session>(raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Discarding unreadable session '{}': {}", key, e);
                entries.remove(key);
                Ok(None)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<(), Pdf2EpubError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::llm::{Part, Role, Turn};
    use tempfile::TempDir;

    fn sample_session() -> Session {
        Session {
            next_chunk_index: 2,
            total_pages: 12,
            chunk_size: 5,
            conversation: ConversationState::from_turns(vec![
                Turn::user(vec![Part::text("--- PAGE 1 ---\nhello")]),
                Turn::model("OK"),
            ]),
            images: vec![ExtractedImage {
                mime_type: "image/png".into(),
                data: "iVBORw0KGgo=".into(),
            }],
        }
    }

    #[test]
    fn wire_shape_uses_persisted_key_names() {
        let value = serde_json::to_value(sample_session()).unwrap();
        assert_eq!(value["currentChunk"], 2);
        assert_eq!(value["numPages"], 12);
        assert_eq!(value["chunkSize"], 5);
        assert_eq!(value["chatHistory"][0]["role"], "user");
        assert_eq!(value["chatHistory"][1]["parts"][0]["text"], "OK");
        assert_eq!(value["allImages"][0]["mimeType"], "image/png");
    }

    #[test]
    fn file_store_round_trip_and_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let key = "epub-session-book.pdf-1234";

        assert_eq!(store.load(key).unwrap(), None);

        let mut session = sample_session();
        store.save(key, &session).unwrap();
        assert_eq!(store.load(key).unwrap(), Some(session.clone()));

        session.next_chunk_index = 3;
        store.save(key, &session).unwrap();
        assert_eq!(store.load(key).unwrap().unwrap().next_chunk_index, 3);

        // No temp file left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn file_store_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let key = "epub-session-a.pdf-1";
        store.delete(key).unwrap();
        store.save(key, &sample_session()).unwrap();
        store.delete(key).unwrap();
        store.delete(key).unwrap();
        assert_eq!(store.load(key).unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_removed_and_reported_absent() {
        let dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(dir.path());
        let key = "epub-session-bad.pdf-9";
        fs::create_dir_all(dir.path()).unwrap();
        fs::write(store.path_for(key), b"{\"currentChunk\": 1").unwrap();

        assert_eq!(store.load(key).unwrap(), None);
        assert!(!store.path_for(key).exists());
    }

    #[test]
    fn record_without_chunk_size_gets_the_default() {
        let store = MemorySessionStore::new();
        let key = "epub-session-old.pdf-5";
        store.insert_raw(key, r#"{"currentChunk": 0, "numPages": 3, "chatHistory": []}"#);
        let session = store.load(key).unwrap().unwrap();
        assert_eq!(session.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(session.total_pages, 3);
    }

    #[test]
    fn record_missing_history_is_malformed() {
        let store = MemorySessionStore::new();
        let key = "epub-session-x.pdf-3";
        store.insert_raw(key, r#"{"currentChunk": 1, "numPages": 3}"#);
        assert_eq!(store.load(key).unwrap(), None);
        assert!(!store.contains(key));
    }

    #[test]
    fn keys_are_sanitised_into_file_names() {
        let store = FileSessionStore::new("/tmp/sessions");
        let path = store.path_for("epub-session-my book/v2.pdf-77");
        assert_eq!(
            path,
            PathBuf::from("/tmp/sessions/epub-session-my_book_v2.pdf-77.json")
        );
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemorySessionStore::new();
        let key = "epub-session-m.pdf-5";
        store.save(key, &sample_session()).unwrap();
        let loaded = store.load(key).unwrap().unwrap();
        assert_eq!(loaded.conversation.turns()[1].role, Role::Model);
        store.delete(key).unwrap();
        assert!(!store.contains(key));
    }
}

//! File-backed event store.
//!
//! Sessions are stored under the data directory:
//!
//! ```text
//! <root>/sessions/<sessionId>/
//! ├── session.json     # Session record (owner, module, createdAt)
//! └── events.jsonl     # Append-only event log, one event per line
//! ```
//!
//! Each append is a single `write` of newline-terminated lines followed by
//! `sync_data`. If either fails the file is cut back to its previous length.
//! A crash mid-write can only leave a torn final line without its newline;
//! readers skip it and the next append truncates it away.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};
use crate::store::{check_sequence, EventStore};
use crate::types::{ConversationEvent, SessionRecord};

/// Cached head `eventSeq` per session; `None` until first read from disk.
type HeadSlot = Arc<Mutex<Option<u64>>>;

/// Event store writing JSONL files under a root directory
#[derive(Clone)]
pub struct JsonlEventStore {
    root: PathBuf,
    heads: Arc<Mutex<HashMap<String, HeadSlot>>>,
}

impl JsonlEventStore {
    /// Create a store rooted at `root` (created lazily)
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            heads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Directory of a session. Ids are a single path component of
    /// `[A-Za-z0-9_-]`; anything else cannot name a stored session.
    fn session_dir(&self, session_id: &str) -> ChatResult<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.sessions_dir().join(session_id))
    }

    /// Directory of a session that must already exist
    fn existing_session_dir(&self, session_id: &str) -> ChatResult<PathBuf> {
        let dir = self.session_dir(session_id)?;
        if !dir.is_dir() {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        }
        Ok(dir)
    }

    fn head_slot(&self, session_id: &str) -> HeadSlot {
        self.heads
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn read_record(&self, session_id: &str) -> ChatResult<SessionRecord> {
        let path = self.existing_session_dir(session_id)?.join("session.json");
        if !path.exists() {
            return Err(ChatError::SessionNotFound(session_id.to_string()));
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Drop a torn trailing line and return the last durable `eventSeq`.
    fn repair_tail(path: &Path) -> ChatResult<u64> {
        if !path.exists() {
            return Ok(0);
        }

        let bytes = fs::read(path)?;
        let keep = durable_len(&bytes);
        if keep < bytes.len() {
            warn!(
                "Truncating torn tail of {:?} ({} bytes)",
                path,
                bytes.len() - keep
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(keep as u64)?;
            file.sync_data()?;
        }

        match lines(&bytes[..keep]).last() {
            Some(line) => Ok(serde_json::from_slice::<ConversationEvent>(line)?.event_seq),
            None => Ok(0),
        }
    }

    fn parse_events(path: &Path, bytes: &[u8]) -> ChatResult<Vec<ConversationEvent>> {
        let keep = durable_len(bytes);
        if keep < bytes.len() {
            warn!(
                "Ignoring torn final line in {:?} ({} bytes)",
                path,
                bytes.len() - keep
            );
        }

        lines(&bytes[..keep])
            .map(|line| serde_json::from_slice::<ConversationEvent>(line).map_err(Into::into))
            .collect()
    }
}

/// Length of the newline-terminated prefix; anything after it is torn
fn durable_len(bytes: &[u8]) -> usize {
    bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1)
}

/// Non-blank lines of a JSONL buffer
fn lines(bytes: &[u8]) -> impl DoubleEndedIterator<Item = &[u8]> {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
}

/// File operations an append relies on
trait AppendTarget: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_data()
    }
}

/// Write and sync `bytes`; on failure cut the target back to `len_before`
fn write_durably<T: AppendTarget>(target: &mut T, bytes: &[u8], len_before: u64) -> io::Result<()> {
    let result = target.write_all(bytes).and_then(|_| target.sync());
    if let Err(e) = &result {
        if let Err(rollback) = target.truncate_to(len_before) {
            warn!("Failed to roll back append after '{}': {}", e, rollback);
        }
    }
    result
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn create_session(&self, record: &SessionRecord) -> ChatResult<()> {
        let dir = self.session_dir(&record.session_id)?;
        fs::create_dir_all(&dir)?;

        let content = serde_json::to_string_pretty(record)?;
        fs::write(dir.join("session.json"), content)?;
        File::create(dir.join("events.jsonl"))?;

        *self.head_slot(&record.session_id).lock() = Some(0);
        debug!("Created session directory {:?}", dir);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> ChatResult<SessionRecord> {
        self.read_record(session_id)
    }

    async fn list_sessions(&self) -> ChatResult<Vec<SessionRecord>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(id) = path.file_name().and_then(|n| n.to_str()) {
                match self.read_record(id) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping unreadable session {}: {}", id, e),
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn append_batch(&self, session_id: &str, events: &[ConversationEvent]) -> ChatResult<()> {
        let path = self.existing_session_dir(session_id)?.join("events.jsonl");
        let slot = self.head_slot(session_id);
        let mut head = slot.lock();

        let current = match *head {
            Some(seq) => seq,
            None => {
                let seq = Self::repair_tail(&path)?;
                *head = Some(seq);
                seq
            }
        };
        check_sequence(session_id, current, events)?;

        let Some(last) = events.last() else {
            return Ok(());
        };

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                let len_before = file.metadata()?.len();
                write_durably(&mut file, &buf, len_before)
            });

        if let Err(e) = written {
            // Re-read the head (and repair) before the next append
            *head = None;
            return Err(e.into());
        }

        *head = Some(last.event_seq);
        Ok(())
    }

    async fn load_events(&self, session_id: &str) -> ChatResult<Vec<ConversationEvent>> {
        let path = self.existing_session_dir(session_id)?.join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }

        let bytes = fs::read(&path)?;
        Self::parse_events(&path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;
    use serde_json::json;
    use tempfile::tempdir;

    fn user_event(seq: u64, content: &str) -> ConversationEvent {
        ConversationEvent::new(
            seq,
            EventKind::MessageUser,
            json!({"role": "user", "content": content}),
        )
    }

    #[tokio::test]
    async fn test_create_and_load_session() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());

        let record = SessionRecord::new("subject-1", 3);
        store.create_session(&record).await.unwrap();

        let loaded = store.load_session(&record.session_id).await.unwrap();
        assert_eq!(loaded, record);
        assert!(store.load_events(&record.session_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_persistence() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());
        let record = SessionRecord::new("subject-1", 1);
        store.create_session(&record).await.unwrap();

        store.append(&record.session_id, &user_event(1, "Hello")).await.unwrap();
        store.append(&record.session_id, &user_event(2, "Again")).await.unwrap();

        // A fresh handle must see the same log and head
        let reopened = JsonlEventStore::new(temp.path());
        let events = reopened.load_events(&record.session_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload["content"], "Hello");
        assert_eq!(events[1].event_seq, 2);

        let err = reopened
            .append(&record.session_id, &user_event(2, "dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::SequenceConflict { expected: 3, .. }));
        reopened.append(&record.session_id, &user_event(3, "ok")).await.unwrap();
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored_then_truncated() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());
        let record = SessionRecord::new("subject-1", 1);
        store.create_session(&record).await.unwrap();
        store.append(&record.session_id, &user_event(1, "Hello")).await.unwrap();

        // Simulate a crash halfway through writing event 2
        let path = temp
            .path()
            .join("sessions")
            .join(&record.session_id)
            .join("events.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"eventSeq":2,"type":"message.us"#).unwrap();

        let reopened = JsonlEventStore::new(temp.path());
        let events = reopened.load_events(&record.session_id).await.unwrap();
        assert_eq!(events.len(), 1);

        reopened.append(&record.session_id, &user_event(2, "Retry")).await.unwrap();
        let events = reopened.load_events(&record.session_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload["content"], "Retry");
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn test_torn_multibyte_tail_is_repaired() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());
        let record = SessionRecord::new("subject-1", 1);
        store.create_session(&record).await.unwrap();
        store.append(&record.session_id, &user_event(1, "café")).await.unwrap();

        // Crash in the middle of the two bytes of 'é'
        let path = temp
            .path()
            .join("sessions")
            .join(&record.session_id)
            .join("events.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"eventSeq\":2,\"payload\":{\"content\":\"caf\xC3").unwrap();

        let reopened = JsonlEventStore::new(temp.path());
        let events = reopened.load_events(&record.session_id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["content"], "café");

        reopened.append(&record.session_id, &user_event(2, "déjà vu")).await.unwrap();
        let events = reopened.load_events(&record.session_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload["content"], "déjà vu");
    }

    #[tokio::test]
    async fn test_batch_lands_together() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());
        let record = SessionRecord::new("subject-1", 1);
        store.create_session(&record).await.unwrap();

        store
            .append_batch(&record.session_id, &[user_event(1, "a"), user_event(2, "b")])
            .await
            .unwrap();
        let err = store
            .append_batch(&record.session_id, &[user_event(3, "c"), user_event(5, "e")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChatError::SequenceConflict {
                attempted: 5,
                expected: 4,
                ..
            }
        ));

        let events = store.load_events(&record.session_id).await.unwrap();
        assert_eq!(events.iter().map(|e| e.event_seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_session_ids_cannot_leave_the_root() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path().join("store"));

        // Plant a session outside the store root
        let outside = temp.path().join("planted");
        fs::create_dir_all(&outside).unwrap();
        fs::write(
            outside.join("session.json"),
            serde_json::to_string(&SessionRecord::new("x", 1)).unwrap(),
        )
        .unwrap();
        fs::write(outside.join("events.jsonl"), "").unwrap();

        let absolute = outside.to_string_lossy().to_string();
        for id in ["../../planted", "../planted", absolute.as_str(), "a/b", ""] {
            let err = store.load_events(id).await.unwrap_err();
            assert!(matches!(err, ChatError::SessionNotFound(_)), "id {:?}", id);
            let err = store.append(id, &user_event(1, "x")).await.unwrap_err();
            assert!(matches!(err, ChatError::SessionNotFound(_)), "id {:?}", id);
            assert!(store.load_session(id).await.is_err());
        }
        assert!(fs::read_to_string(outside.join("events.jsonl")).unwrap().is_empty());
    }

    /// In-memory file whose sync always fails
    struct FailingSync {
        data: Vec<u8>,
    }

    impl Write for FailingSync {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendTarget for FailingSync {
        fn sync(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "sync failed"))
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_sync_rolls_back_the_write() {
        let mut target = FailingSync {
            data: b"{\"eventSeq\":1}\n".to_vec(),
        };
        let before = target.data.clone();

        let err = write_durably(&mut target, b"{\"eventSeq\":2}\n", before.len() as u64).unwrap_err();
        assert_eq!(err.to_string(), "sync failed");
        assert_eq!(target.data, before);
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());
        assert!(store.list_sessions().await.unwrap().is_empty());

        store.create_session(&SessionRecord::new("a", 1)).await.unwrap();
        store.create_session(&SessionRecord::new("b", 2)).await.unwrap();

        let sessions = store.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 2);
    }

    #[tokio::test]
    async fn test_append_to_unknown_session() {
        let temp = tempdir().unwrap();
        let store = JsonlEventStore::new(temp.path());
        let err = store.append("nope", &user_event(1, "x")).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound(_)));
    }
}

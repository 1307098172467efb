//! Storage seam for the event log.
//!
//! The protocol does not care how events are stored, only that an append is
//! all-or-nothing and that `eventSeq` is checked against the stored head.
//! Two backends ship with the crate:
//!
//! - [`MemoryEventStore`]: in-process, used by tests and ephemeral servers
//! - [`JsonlEventStore`](crate::persistence::JsonlEventStore): append-only files

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{ChatError, ChatResult};
use crate::types::{ConversationEvent, SessionRecord};

/// Durable storage for sessions and their events.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist a new session record.
    async fn create_session(&self, record: &SessionRecord) -> ChatResult<()>;

    /// Load a session record.
    async fn load_session(&self, session_id: &str) -> ChatResult<SessionRecord>;

    /// List all session records.
    async fn list_sessions(&self) -> ChatResult<Vec<SessionRecord>>;

    /// Append a run of events as one unit: either all of them are stored or
    /// none is. The first `eventSeq` must be exactly one above the stored head
    /// and the run must be contiguous, otherwise the store answers
    /// `SequenceConflict` and writes nothing.
    async fn append_batch(&self, session_id: &str, events: &[ConversationEvent]) -> ChatResult<()>;

    /// Append one event.
    async fn append(&self, session_id: &str, event: &ConversationEvent) -> ChatResult<()> {
        self.append_batch(session_id, std::slice::from_ref(event)).await
    }

    /// Load every event of a session, ascending by `eventSeq`.
    async fn load_events(&self, session_id: &str) -> ChatResult<Vec<ConversationEvent>>;
}

/// Check that `events` continue the log directly after `head`
pub(crate) fn check_sequence(
    session_id: &str,
    head: u64,
    events: &[ConversationEvent],
) -> ChatResult<()> {
    for (offset, event) in events.iter().enumerate() {
        let expected = head + 1 + offset as u64;
        if event.event_seq != expected {
            return Err(ChatError::SequenceConflict {
                session_id: session_id.to_string(),
                attempted: event.event_seq,
                expected,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct MemorySession {
    record: SessionRecord,
    events: Vec<ConversationEvent>,
}

/// In-memory event store.
///
/// Can be flipped to "unavailable" to simulate a storage outage, or told to
/// fail the one append that would store a given `eventSeq`.
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    sessions: Arc<RwLock<HashMap<String, MemorySession>>>,
    unavailable: Arc<AtomicBool>,
    fail_at: Arc<RwLock<Option<u64>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StorageUnavailable` (or recover).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next append whose batch contains `event_seq`; later appends succeed.
    pub fn fail_next_append_at(&self, event_seq: u64) {
        *self.fail_at.write() = Some(event_seq);
    }

    fn check_available(&self) -> ChatResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChatError::StorageUnavailable(
                "memory store is offline".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn create_session(&self, record: &SessionRecord) -> ChatResult<()> {
        self.check_available()?;
        self.sessions.write().insert(
            record.session_id.clone(),
            MemorySession {
                record: record.clone(),
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> ChatResult<SessionRecord> {
        self.check_available()?;
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))
    }

    async fn list_sessions(&self) -> ChatResult<Vec<SessionRecord>> {
        self.check_available()?;
        Ok(self
            .sessions
            .read()
            .values()
            .map(|s| s.record.clone())
            .collect())
    }

    async fn append_batch(&self, session_id: &str, events: &[ConversationEvent]) -> ChatResult<()> {
        self.check_available()?;
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;

        let head = session.events.last().map_or(0, |e| e.event_seq);
        check_sequence(session_id, head, events)?;

        {
            let mut fail_at = self.fail_at.write();
            if let Some(seq) = *fail_at {
                if events.iter().any(|e| e.event_seq == seq) {
                    *fail_at = None;
                    return Err(ChatError::StorageUnavailable(format!(
                        "injected failure at eventSeq {}",
                        seq
                    )));
                }
            }
        }

        session.events.extend_from_slice(events);
        Ok(())
    }

    async fn load_events(&self, session_id: &str) -> ChatResult<Vec<ConversationEvent>> {
        self.check_available()?;
        self.sessions
            .read()
            .get(session_id)
            .map(|s| s.events.clone())
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))
    }
}

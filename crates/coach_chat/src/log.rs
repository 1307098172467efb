//! Per-session event log.
//!
//! [`EventLog`] is the single source of truth for conversation and module
//! state. It assigns `eventSeq` values and serializes every mutation of a
//! session behind that session's lock; different sessions never contend.
//!
//! Compound decisions (select-if-unselected, complete-if-incomplete) are made
//! through a [`SessionWriter`], which holds the session lock for its whole
//! lifetime so the check and the append form one step.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{ChatError, ChatResult};
use crate::projection::{self, SessionProjection};
use crate::store::EventStore;
use crate::types::{ConversationEvent, EventKind, Session, SessionPhase, SessionRecord};

/// Prune dead lock entries once the map grows past this size
const LOCK_PRUNE_THRESHOLD: usize = 128;

/// Lazily created per-session async locks
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl SessionLocks {
    fn get(&self, session_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();

        if locks.len() > LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(session_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(session_id.to_string(), Arc::downgrade(&lock));
        lock
    }
}

/// Append-only, per-session ordered event log
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn EventStore>,
    locks: Arc<SessionLocks>,
}

impl EventLog {
    /// Create an event log over a storage backend
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            locks: Arc::new(SessionLocks::default()),
        }
    }

    /// Create a new session for a subject and module
    pub async fn create_session(
        &self,
        subject_id: &str,
        module_number: u32,
    ) -> ChatResult<Session> {
        let record = SessionRecord::new(subject_id, module_number);
        self.store.create_session(&record).await?;
        info!(
            session_id = %record.session_id,
            subject_id,
            module_number,
            "Created module session"
        );
        Ok(Session::from_record(record, SessionPhase::Active))
    }

    /// Return the newest session for a subject/module, creating one on first entry.
    ///
    /// Entries for the same subject and module are serialized so concurrent
    /// first entries share one session.
    pub async fn enter_module(&self, subject_id: &str, module_number: u32) -> ChatResult<Session> {
        let entry_lock = self
            .locks
            .get(&format!("enter/{}/{}", subject_id, module_number));
        let _entry = entry_lock.lock().await;

        let latest = self
            .store
            .list_sessions()
            .await?
            .into_iter()
            .filter(|r| r.subject_id == subject_id && r.module_number == module_number)
            .max_by(|a, b| a.created_at.cmp(&b.created_at));

        match latest {
            Some(record) => self.session(&record.session_id).await,
            None => self.create_session(subject_id, module_number).await,
        }
    }

    /// Load a session with its phase folded from the log
    pub async fn session(&self, session_id: &str) -> ChatResult<Session> {
        let writer = self.writer(session_id).await?;
        Ok(writer.session())
    }

    /// List all sessions with their folded phase
    pub async fn list_sessions(&self) -> ChatResult<Vec<Session>> {
        let records = self.store.list_sessions().await?;
        let mut sessions = Vec::with_capacity(records.len());
        for record in records {
            sessions.push(self.session(&record.session_id).await?);
        }
        Ok(sessions)
    }

    /// Append one event, assigning the next `eventSeq`
    pub async fn append(
        &self,
        session_id: &str,
        kind: EventKind,
        payload: impl Serialize,
    ) -> ChatResult<ConversationEvent> {
        let mut writer = self.writer(session_id).await?;
        writer.append(kind, payload).await
    }

    /// All events of a session, ascending by `eventSeq`
    pub async fn list(&self, session_id: &str) -> ChatResult<Vec<ConversationEvent>> {
        let writer = self.writer(session_id).await?;
        Ok(writer.into_events())
    }

    /// Fold the session's events into its read-state projection
    pub async fn project(&self, session_id: &str) -> ChatResult<SessionProjection> {
        let writer = self.writer(session_id).await?;
        Ok(writer.projection())
    }

    /// Take the session lock and load the current log.
    ///
    /// Do not call other `EventLog` methods for the same session while the
    /// writer is alive; they wait on the same lock.
    pub async fn writer(&self, session_id: &str) -> ChatResult<SessionWriter> {
        let guard = self.locks.get(session_id).lock_owned().await;
        let record = self.store.load_session(session_id).await?;
        let events = self.store.load_events(session_id).await?;

        Ok(SessionWriter {
            store: self.store.clone(),
            record,
            events,
            _guard: guard,
        })
    }
}

/// Exclusive handle on one session's log
pub struct SessionWriter {
    store: Arc<dyn EventStore>,
    record: SessionRecord,
    events: Vec<ConversationEvent>,
    _guard: OwnedMutexGuard<()>,
}

impl SessionWriter {
    pub fn session_id(&self) -> &str {
        &self.record.session_id
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Events as of now, including any appended through this writer
    pub fn events(&self) -> &[ConversationEvent] {
        &self.events
    }

    pub fn head_seq(&self) -> u64 {
        self.events.last().map_or(0, |e| e.event_seq)
    }

    pub fn phase(&self) -> SessionPhase {
        if self.events.iter().any(|e| e.kind == EventKind::Complete) {
            SessionPhase::Complete
        } else {
            SessionPhase::Active
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase() == SessionPhase::Complete
    }

    pub fn session(&self) -> Session {
        Session::from_record(self.record.clone(), self.phase())
    }

    pub fn projection(&self) -> SessionProjection {
        projection::fold(&self.session(), &self.events)
    }

    /// Append an event at `head + 1`.
    ///
    /// Completed sessions only accept a `module.complete` event; the caller
    /// decides whether a second completion is a no-op.
    pub async fn append(
        &mut self,
        kind: EventKind,
        payload: impl Serialize,
    ) -> ChatResult<ConversationEvent> {
        let payload = serde_json::to_value(payload)?;
        let mut events = self.append_all(vec![(kind, payload)]).await?;
        events
            .pop()
            .ok_or_else(|| ChatError::StorageUnavailable("append stored no event".to_string()))
    }

    /// Append several events as one unit at `head + 1..`; either all are
    /// stored or none is.
    pub async fn append_all(
        &mut self,
        entries: Vec<(EventKind, Value)>,
    ) -> ChatResult<Vec<ConversationEvent>> {
        if self.is_complete() && entries.iter().any(|(kind, _)| !kind.allowed_after_completion()) {
            return Err(ChatError::SessionComplete(self.record.session_id.clone()));
        }

        let head = self.head_seq();
        let batch: Vec<ConversationEvent> = entries
            .into_iter()
            .enumerate()
            .map(|(offset, (kind, payload))| ConversationEvent::new(head + 1 + offset as u64, kind, payload))
            .collect();
        self.store.append_batch(&self.record.session_id, &batch).await?;

        for event in &batch {
            debug!(
                session_id = %self.record.session_id,
                event_seq = event.event_seq,
                kind = %event.kind,
                "Appended event"
            );
        }
        self.events.extend_from_slice(&batch);
        Ok(batch)
    }

    pub fn into_events(self) -> Vec<ConversationEvent> {
        self.events
    }
}

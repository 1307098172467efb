//! Read-state projection.
//!
//! Every derived view (transcript, pending outcomes, progress, completion) is
//! a pure fold over the event log in `eventSeq` order. Nothing here is cached
//! between calls; a client refresh simply folds again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{
    CompletePayload, CompletionSummary, ConversationEvent, EventKind, MessagePayload,
    MessageRole, OutcomeOption, OutcomeSelectedPayload, OutcomesAddedPayload, ProgressPayload,
    Session, SessionPhase,
};

/// One transcript line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptEntry {
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    pub role: MessageRole,
    pub content: String,
}

/// Outcomes prompt still waiting for a choice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingOutcomes {
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    pub options: Vec<OutcomeOption>,
}

/// Outcomes prompt that has been resolved
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedOutcome {
    #[serde(rename = "outcomesEventSeq")]
    pub outcomes_event_seq: u64,
    #[serde(rename = "selectionEventSeq")]
    pub selection_event_seq: u64,
    #[serde(rename = "optionId")]
    pub option_id: String,
    pub label: String,
    pub value: String,
}

/// One `module.progress` event as reported and as exposed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPoint {
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    pub reported: u8,
    pub exposed: u8,
}

/// Fully folded state of one session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionProjection {
    pub session: Session,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(rename = "pendingOutcomes")]
    pub pending_outcomes: Vec<PendingOutcomes>,
    #[serde(rename = "resolvedOutcomes")]
    pub resolved_outcomes: Vec<ResolvedOutcome>,
    /// Monotonic progress; `None` until the first report
    pub progress: Option<u8>,
    #[serde(rename = "progressHistory")]
    pub progress_history: Vec<ProgressPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<CompletionSummary>,
    #[serde(rename = "lastEventSeq")]
    pub last_event_seq: u64,
}

impl SessionProjection {
    pub fn is_complete(&self) -> bool {
        self.session.phase == SessionPhase::Complete
    }

    /// Last user message in the transcript
    pub fn last_user_message(&self) -> Option<&TranscriptEntry> {
        self.transcript.iter().rev().find(|t| t.role == MessageRole::User)
    }
}

/// Fold events into a projection. Stored payloads that fail to decode are
/// skipped with a warning.
pub fn fold(session: &Session, events: &[ConversationEvent]) -> SessionProjection {
    let mut transcript = Vec::new();
    let mut offered: BTreeMap<u64, Vec<OutcomeOption>> = BTreeMap::new();
    let mut resolved: BTreeMap<u64, ResolvedOutcome> = BTreeMap::new();
    let mut progress: Option<u8> = None;
    let mut progress_history = Vec::new();
    let mut summary = None;

    for event in events {
        match event.kind {
            EventKind::MessageUser | EventKind::MessageAssistant => {
                if let Some(message) = decode::<MessagePayload>(session, event) {
                    transcript.push(TranscriptEntry {
                        event_seq: event.event_seq,
                        role: message.role,
                        content: message.content,
                    });
                }
            }
            EventKind::StructuredOutcomesAdded => {
                if let Some(payload) = decode::<OutcomesAddedPayload>(session, event) {
                    offered.insert(event.event_seq, payload.options);
                }
            }
            EventKind::OutcomeSelected => {
                if let Some(payload) = decode::<OutcomeSelectedPayload>(session, event) {
                    // First selection wins; the log never holds a second one
                    if resolved.contains_key(&payload.outcomes_event_seq) {
                        continue;
                    }
                    let label = offered
                        .get(&payload.outcomes_event_seq)
                        .and_then(|opts| opts.iter().find(|o| o.id == payload.option_id))
                        .map(|o| o.label.clone())
                        .unwrap_or_else(|| payload.option_id.clone());
                    resolved.insert(
                        payload.outcomes_event_seq,
                        ResolvedOutcome {
                            outcomes_event_seq: payload.outcomes_event_seq,
                            selection_event_seq: event.event_seq,
                            option_id: payload.option_id,
                            label,
                            value: payload.value,
                        },
                    );
                }
            }
            EventKind::Progress => {
                if let Some(payload) = decode::<ProgressPayload>(session, event) {
                    let exposed = progress.map_or(payload.percent, |p| p.max(payload.percent));
                    progress = Some(exposed);
                    progress_history.push(ProgressPoint {
                        event_seq: event.event_seq,
                        reported: payload.percent,
                        exposed,
                    });
                }
            }
            EventKind::Complete => {
                if summary.is_none() {
                    if let Some(payload) = decode::<CompletePayload>(session, event) {
                        summary = Some(payload.summary);
                    }
                }
            }
        }
    }

    let pending_outcomes = offered
        .into_iter()
        .filter(|(seq, _)| !resolved.contains_key(seq))
        .map(|(event_seq, options)| PendingOutcomes { event_seq, options })
        .collect();

    let mut session = session.clone();
    session.phase = if events.iter().any(|e| e.kind == EventKind::Complete) {
        SessionPhase::Complete
    } else {
        SessionPhase::Active
    };

    SessionProjection {
        session,
        transcript,
        pending_outcomes,
        resolved_outcomes: resolved.into_values().collect(),
        progress,
        progress_history,
        summary,
        last_event_seq: events.last().map_or(0, |e| e.event_seq),
    }
}

fn decode<T: serde::de::DeserializeOwned>(session: &Session, event: &ConversationEvent) -> Option<T> {
    match event.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(
                session_id = %session.session_id,
                event_seq = event.event_seq,
                kind = %event.kind,
                "Skipping undecodable payload: {}",
                e
            );
            None
        }
    }
}

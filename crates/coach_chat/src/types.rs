//! Core types for the conversation event protocol.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ChatResult;

/// Unique identifier for a module session
pub type SessionId = String;

/// Lowest progress value a module may report
pub const MIN_PROGRESS: u8 = 5;
/// Highest progress value a module may report
pub const MAX_PROGRESS: u8 = 100;

/// Phase of a module session, always derived from its event log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Active,
    Complete,
}

impl Default for SessionPhase {
    fn default() -> Self {
        Self::Active
    }
}

/// Stored session metadata. Phase is not stored; see [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    /// Owner of the session
    #[serde(rename = "subjectId")]
    pub subject_id: String,
    #[serde(rename = "moduleNumber")]
    pub module_number: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Create a new session record with a fresh ID
    pub fn new(subject_id: impl Into<String>, module_number: u32) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject_id: subject_id.into(),
            module_number,
            created_at: Utc::now(),
        }
    }
}

/// A module conversation instance with its folded phase
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "subjectId")]
    pub subject_id: String,
    #[serde(rename = "moduleNumber")]
    pub module_number: u32,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    pub phase: SessionPhase,
}

impl Session {
    pub fn from_record(record: SessionRecord, phase: SessionPhase) -> Self {
        Self {
            session_id: record.session_id,
            subject_id: record.subject_id,
            module_number: record.module_number,
            created_at: record.created_at,
            phase,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == SessionPhase::Complete
    }
}

/// Kind of a durable conversation event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "message.user")]
    MessageUser,
    #[serde(rename = "message.assistant")]
    MessageAssistant,
    #[serde(rename = "module.structured_outcomes_added")]
    StructuredOutcomesAdded,
    #[serde(rename = "module.outcome_selected")]
    OutcomeSelected,
    #[serde(rename = "module.progress")]
    Progress,
    #[serde(rename = "module.complete")]
    Complete,
}

impl EventKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageUser => "message.user",
            Self::MessageAssistant => "message.assistant",
            Self::StructuredOutcomesAdded => "module.structured_outcomes_added",
            Self::OutcomeSelected => "module.outcome_selected",
            Self::Progress => "module.progress",
            Self::Complete => "module.complete",
        }
    }

    /// Whether a completed session still accepts this kind
    pub fn allowed_after_completion(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable entry in a session's event log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationEvent {
    /// Per-session sequence number, gap-free and strictly increasing
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl ConversationEvent {
    pub fn new(event_seq: u64, kind: EventKind, payload: Value) -> Self {
        Self {
            event_seq,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }

    /// Decode the payload into its typed form
    pub fn payload_as<T: DeserializeOwned>(&self) -> ChatResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Message role in the transcript
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Where a user message came from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// Typed by the user
    Typed,
    /// Synthesized from a structured outcome selection
    OutcomeSelection,
}

/// Payload of `message.user` / `message.assistant`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<MessageSource>,
}

impl MessagePayload {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            source: Some(MessageSource::Typed),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            source: None,
        }
    }

    /// User message standing in for a selected option
    pub fn selection(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            source: Some(MessageSource::OutcomeSelection),
        }
    }
}

/// One choice inside a structured outcomes prompt
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeOption {
    pub id: String,
    pub label: String,
    pub value: String,
}

impl OutcomeOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Payload of `module.structured_outcomes_added`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomesAddedPayload {
    pub options: Vec<OutcomeOption>,
}

impl OutcomesAddedPayload {
    pub fn option(&self, option_id: &str) -> Option<&OutcomeOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// Payload of `module.outcome_selected`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutcomeSelectedPayload {
    /// The outcomes event this selection resolves
    #[serde(rename = "eventSeq")]
    pub outcomes_event_seq: u64,
    #[serde(rename = "optionId")]
    pub option_id: String,
    pub value: String,
}

/// Payload of `module.progress`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressPayload {
    /// Raw reported value, kept even when lower than an earlier report
    pub percent: u8,
}

/// Structured summary that finalizes a module
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionSummary {
    pub insights: Vec<String>,
    pub assessment: String,
    pub takeaway: String,
}

/// Payload of `module.complete`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletePayload {
    pub summary: CompletionSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::StructuredOutcomesAdded).unwrap();
        assert_eq!(json, "\"module.structured_outcomes_added\"");

        let kind: EventKind = serde_json::from_str("\"message.assistant\"").unwrap();
        assert_eq!(kind, EventKind::MessageAssistant);
        assert_eq!(EventKind::OutcomeSelected.to_string(), "module.outcome_selected");
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = ConversationEvent::new(
            7,
            EventKind::OutcomeSelected,
            serde_json::to_value(OutcomeSelectedPayload {
                outcomes_event_seq: 4,
                option_id: "mod_opt_1".to_string(),
                value: "continue".to_string(),
            })
            .unwrap(),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["eventSeq"], 7);
        assert_eq!(json["type"], "module.outcome_selected");
        assert_eq!(json["payload"]["eventSeq"], 4);
        assert_eq!(json["payload"]["optionId"], "mod_opt_1");

        let payload: OutcomeSelectedPayload = event.payload_as().unwrap();
        assert_eq!(payload.outcomes_event_seq, 4);
    }

    #[test]
    fn test_only_completion_allowed_after_completion() {
        assert!(EventKind::Complete.allowed_after_completion());
        assert!(!EventKind::MessageUser.allowed_after_completion());
        assert!(!EventKind::StructuredOutcomesAdded.allowed_after_completion());
    }
}

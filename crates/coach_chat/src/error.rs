//! Error types for the conversation protocol.

use thiserror::Error;

/// Result type for protocol operations
pub type ChatResult<T> = Result<T, ChatError>;

/// Protocol errors.
///
/// Variants fall into four families: transient (retry the whole request),
/// malformed input, protocol violations, and selection conflicts.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session_id} belongs to module {actual}, not module {requested}")]
    ModuleMismatch {
        session_id: String,
        requested: u32,
        actual: u32,
    },

    #[error("Session {0} is already complete")]
    SessionComplete(String),

    #[error("A turn is already in progress for session {0}")]
    TurnInProgress(String),

    #[error("No structured outcomes event with eventSeq {event_seq} in session {session_id}")]
    OutcomesNotFound { session_id: String, event_seq: u64 },

    #[error("Option '{option_id}' is not offered by outcomes event {event_seq}")]
    InvalidOption { event_seq: u64, option_id: String },

    #[error("Outcomes event {outcomes_event_seq} was already resolved with '{chosen_option_id}'")]
    Conflict {
        outcomes_event_seq: u64,
        chosen_option_id: String,
        chosen_label: String,
    },

    #[error("Invalid structured outcomes: {0}")]
    InvalidOutcomes(String),

    #[error("Progress must be within [5, 100], got {0}")]
    InvalidProgress(i64),

    #[error("Invalid completion summary: {0}")]
    InvalidSummary(String),

    #[error("Invalid tool call '{tool}': {reason}")]
    InvalidToolCall { tool: String, reason: String },

    #[error("Append of eventSeq {attempted} to session {session_id} rejected, next eventSeq is {expected}")]
    SequenceConflict {
        session_id: String,
        attempted: u64,
        expected: u64,
    },

    #[error("Event storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Model producer failed: {0}")]
    Producer(String),

    #[error("Stream transport failed: {0}")]
    Transport(String),

    #[error("Model producer did not respond within {0} seconds")]
    ProducerTimeout(u64),

    #[error("LLM not configured. Set OPENAI_API_KEY")]
    LlmNotConfigured,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    /// Whether the caller may safely retry the whole request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_)
                | Self::Producer(_)
                | Self::ProducerTimeout(_)
                | Self::Transport(_)
        )
    }

    /// Whether this is a rejected request against protocol state.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::SessionComplete(_)
                | Self::TurnInProgress(_)
                | Self::OutcomesNotFound { .. }
                | Self::InvalidOption { .. }
                | Self::SessionNotFound(_)
                | Self::ModuleMismatch { .. }
        )
    }

    /// HTTP-equivalent status for the external API layer.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SessionNotFound(_) | Self::OutcomesNotFound { .. } => 404,
            Self::Conflict { .. } | Self::SessionComplete(_) | Self::SequenceConflict { .. } => 409,
            Self::TurnInProgress(_) => 423,
            Self::InvalidOption { .. }
            | Self::InvalidOutcomes(_)
            | Self::InvalidProgress(_)
            | Self::InvalidSummary(_)
            | Self::InvalidToolCall { .. } => 422,
            Self::ModuleMismatch { .. } => 400,
            Self::StorageUnavailable(_)
            | Self::Producer(_)
            | Self::ProducerTimeout(_)
            | Self::Transport(_) => 503,
            Self::LlmNotConfigured | Self::Config(_) | Self::Serialization(_) => 500,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::ModuleMismatch { .. } => "module_mismatch",
            Self::SessionComplete(_) => "session_complete",
            Self::TurnInProgress(_) => "turn_in_progress",
            Self::OutcomesNotFound { .. } => "outcomes_not_found",
            Self::InvalidOption { .. } => "invalid_option",
            Self::Conflict { .. } => "conflict",
            Self::InvalidOutcomes(_) => "invalid_outcomes",
            Self::InvalidProgress(_) => "invalid_progress",
            Self::InvalidSummary(_) => "invalid_summary",
            Self::InvalidToolCall { .. } => "invalid_tool_call",
            Self::SequenceConflict { .. } => "sequence_conflict",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Producer(_) => "producer_error",
            Self::ProducerTimeout(_) => "producer_timeout",
            Self::Transport(_) => "transport_error",
            Self::LlmNotConfigured => "llm_not_configured",
            Self::Config(_) => "config_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Wording shown to the end user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Conflict { chosen_label, .. } => format!("You already chose {}.", chosen_label),
            Self::SessionComplete(_) => "This module is already complete.".to_string(),
            Self::TurnInProgress(_) => {
                "Please wait for the current response to finish.".to_string()
            }
            Self::SessionNotFound(_) | Self::OutcomesNotFound { .. } => {
                "We couldn't find that conversation. Please refresh.".to_string()
            }
            _ => "Something went wrong. Please try again.".to_string(),
        }
    }
}

impl From<std::io::Error> for ChatError {
    fn from(err: std::io::Error) -> Self {
        Self::StorageUnavailable(err.to_string())
    }
}

impl From<toml::de::Error> for ChatError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

//! Command surface.
//!
//! Request/response types and a facade an external API layer can map onto
//! plain endpoints. Failures convert into [`ErrorResponse`] with an
//! HTTP-equivalent status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::CoachConfig;
use crate::error::{ChatError, ChatResult};
use crate::log::EventLog;
use crate::outcomes::OutcomeCoordinator;
use crate::persistence::JsonlEventStore;
use crate::producer::ModelProducer;
use crate::progress::ProgressTracker;
use crate::projection::{SessionProjection, TranscriptEntry};
use crate::store::EventStore;
use crate::turn::{TurnConfig, TurnHandle, TurnProcessor};
use crate::types::{CompletionSummary, ConversationEvent, OutcomeOption, Session};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterModuleRequest {
    pub subject_id: String,
    pub module_number: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterModuleResponse {
    pub success: bool,
    pub session: Session,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentOutcomesRequest {
    pub session_id: String,
    pub module_number: u32,
    pub options: Vec<OutcomeOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentOutcomesResponse {
    pub success: bool,
    pub event_seq: u64,
    pub options: Vec<OutcomeOption>,
    pub events: Vec<ConversationEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectOutcomeRequest {
    pub session_id: String,
    pub module_number: u32,
    /// `eventSeq` of the outcomes event being resolved
    pub event_seq: u64,
    pub option_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectOutcomeResponse {
    pub success: bool,
    /// Set when the same choice had already been recorded
    pub replayed: bool,
    pub transcript: Vec<TranscriptEntry>,
    pub events: Vec<ConversationEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetProgressRequest {
    pub session_id: String,
    pub module_number: u32,
    pub percent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetProgressResponse {
    pub success: bool,
    pub event_seq: u64,
    pub percent: u8,
    /// Exposed, never-decreasing progress
    pub progress: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteModuleRequest {
    pub session_id: String,
    pub module_number: u32,
    pub summary: CompletionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteModuleResponse {
    pub success: bool,
    pub complete: bool,
    pub already_complete: bool,
    pub events: Vec<ConversationEvent>,
    pub summary: CompletionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStateRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadStateResponse {
    pub success: bool,
    #[serde(flatten)]
    pub state: SessionProjection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTurnRequest {
    pub session_id: String,
    pub module_number: u32,
    pub message: String,
}

/// Error body for the external API layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub success: bool,
    /// Wording safe to show the user
    pub error: String,
    pub code: String,
    pub status: u16,
}

impl From<&ChatError> for ErrorResponse {
    fn from(err: &ChatError) -> Self {
        Self {
            success: false,
            error: err.user_message(),
            code: err.code().to_string(),
            status: err.status_code(),
        }
    }
}

/// Facade over the event log, coordinators and turn processor
#[derive(Clone)]
pub struct CoachService {
    log: EventLog,
    outcomes: OutcomeCoordinator,
    progress: ProgressTracker,
    turns: TurnProcessor,
}

impl CoachService {
    pub fn new(
        store: Arc<dyn EventStore>,
        producer: Arc<dyn ModelProducer>,
        turn_config: TurnConfig,
    ) -> Self {
        let log = EventLog::new(store);
        Self {
            outcomes: OutcomeCoordinator::new(log.clone()),
            progress: ProgressTracker::new(log.clone()),
            turns: TurnProcessor::new(log.clone(), producer, turn_config),
            log,
        }
    }

    /// Service over the JSONL store in the configured data directory
    pub fn from_config(config: &CoachConfig, producer: Arc<dyn ModelProducer>) -> Self {
        let store = Arc::new(JsonlEventStore::new(&config.data_dir));
        Self::new(store, producer, config.turn_config())
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn turns(&self) -> &TurnProcessor {
        &self.turns
    }

    async fn check_module(&self, session_id: &str, module_number: u32) -> ChatResult<Session> {
        let session = self.log.session(session_id).await?;
        if session.module_number != module_number {
            return Err(ChatError::ModuleMismatch {
                session_id: session_id.to_string(),
                requested: module_number,
                actual: session.module_number,
            });
        }
        Ok(session)
    }

    pub async fn enter_module(&self, request: EnterModuleRequest) -> ChatResult<EnterModuleResponse> {
        let session = self
            .log
            .enter_module(&request.subject_id, request.module_number)
            .await?;
        Ok(EnterModuleResponse {
            success: true,
            session,
        })
    }

    pub async fn present_outcomes(
        &self,
        request: PresentOutcomesRequest,
    ) -> ChatResult<PresentOutcomesResponse> {
        self.check_module(&request.session_id, request.module_number).await?;
        let presented = self
            .outcomes
            .present_outcomes(&request.session_id, request.options)
            .await?;
        Ok(PresentOutcomesResponse {
            success: true,
            event_seq: presented.event_seq,
            options: presented.options,
            events: presented.events,
        })
    }

    pub async fn select_outcome(
        &self,
        request: SelectOutcomeRequest,
    ) -> ChatResult<SelectOutcomeResponse> {
        let session = self.check_module(&request.session_id, request.module_number).await?;
        let selection = self
            .outcomes
            .select_outcome(&request.session_id, request.event_seq, &request.option_id)
            .await?;

        let events = selection.events;
        let transcript = crate::projection::fold(&session, &events).transcript;

        Ok(SelectOutcomeResponse {
            success: true,
            replayed: selection.replayed,
            transcript,
            events,
        })
    }

    pub async fn set_progress(&self, request: SetProgressRequest) -> ChatResult<SetProgressResponse> {
        self.check_module(&request.session_id, request.module_number).await?;
        let update = self
            .progress
            .set_progress(&request.session_id, request.percent)
            .await?;
        Ok(SetProgressResponse {
            success: true,
            event_seq: update.event_seq,
            percent: update.percent,
            progress: update.exposed,
        })
    }

    pub async fn complete_module(
        &self,
        request: CompleteModuleRequest,
    ) -> ChatResult<CompleteModuleResponse> {
        self.check_module(&request.session_id, request.module_number).await?;
        let outcome = self
            .progress
            .complete_module(&request.session_id, request.summary)
            .await?;
        Ok(CompleteModuleResponse {
            success: true,
            complete: true,
            already_complete: outcome.already_complete,
            events: outcome.events,
            summary: outcome.summary,
        })
    }

    pub async fn read_state(&self, request: ReadStateRequest) -> ChatResult<ReadStateResponse> {
        let state = self.log.project(&request.session_id).await?;
        Ok(ReadStateResponse {
            success: true,
            state,
        })
    }

    /// All events of a session, ascending by `eventSeq`
    pub async fn list_events(&self, session_id: &str) -> ChatResult<Vec<ConversationEvent>> {
        self.log.list(session_id).await
    }

    /// Start a streamed turn
    pub async fn start_turn(&self, request: StartTurnRequest) -> ChatResult<TurnHandle> {
        self.check_module(&request.session_id, request.module_number).await?;
        self.turns
            .start_turn(&request.session_id, &request.message)
            .await
    }
}

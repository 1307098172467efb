//! Progress signal and module completion.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ChatError, ChatResult};
use crate::log::{EventLog, SessionWriter};
use crate::projection::SessionProjection;
use crate::types::{
    CompletePayload, CompletionSummary, ConversationEvent, EventKind, ProgressPayload,
    MAX_PROGRESS, MIN_PROGRESS,
};

/// Result of a progress report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressUpdate {
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    /// Value as reported, stored verbatim
    pub percent: u8,
    /// Value clients see; never lower than an earlier exposed value
    pub exposed: u8,
}

/// Result of a completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub summary: CompletionSummary,
    /// True when the module was already complete and nothing was appended
    #[serde(rename = "alreadyComplete")]
    pub already_complete: bool,
    #[serde(rename = "completeEventSeq")]
    pub complete_event_seq: u64,
    pub events: Vec<ConversationEvent>,
}

/// Tracks module progress and the terminal completion transition
#[derive(Clone)]
pub struct ProgressTracker {
    log: EventLog,
}

impl ProgressTracker {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// Check a reported percentage lies in the accepted range
    pub fn validate_percent(percent: i64) -> ChatResult<u8> {
        if percent < i64::from(MIN_PROGRESS) || percent > i64::from(MAX_PROGRESS) {
            return Err(ChatError::InvalidProgress(percent));
        }
        Ok(percent as u8)
    }

    /// Check every summary field is present and non-blank
    pub fn validate_summary(summary: &CompletionSummary) -> ChatResult<()> {
        if summary.insights.is_empty() {
            return Err(ChatError::InvalidSummary("insights must not be empty".to_string()));
        }
        if summary.insights.iter().any(|i| i.trim().is_empty()) {
            return Err(ChatError::InvalidSummary("insights must not contain blank entries".to_string()));
        }
        if summary.assessment.trim().is_empty() {
            return Err(ChatError::InvalidSummary("assessment must not be empty".to_string()));
        }
        if summary.takeaway.trim().is_empty() {
            return Err(ChatError::InvalidSummary("takeaway must not be empty".to_string()));
        }
        Ok(())
    }

    /// Append a `module.progress` event and return the exposed value
    pub async fn set_progress(&self, session_id: &str, percent: i64) -> ChatResult<ProgressUpdate> {
        let percent = Self::validate_percent(percent)?;
        let mut writer = self.log.writer(session_id).await?;
        Self::set_progress_locked(&mut writer, percent).await
    }

    async fn set_progress_locked(writer: &mut SessionWriter, percent: u8) -> ChatResult<ProgressUpdate> {
        let previous = writer.projection().progress;
        let event = writer
            .append(EventKind::Progress, ProgressPayload { percent })
            .await?;
        let exposed = previous.map_or(percent, |p| p.max(percent));

        info!(
            session_id = writer.session_id(),
            percent, exposed, "Recorded module progress"
        );

        Ok(ProgressUpdate {
            event_seq: event.event_seq,
            percent,
            exposed,
        })
    }

    /// Finalize the module with a summary.
    ///
    /// A second call returns the stored summary and appends nothing, even if
    /// the new summary differs.
    pub async fn complete_module(
        &self,
        session_id: &str,
        summary: CompletionSummary,
    ) -> ChatResult<CompletionOutcome> {
        Self::validate_summary(&summary)?;

        let mut writer = self.log.writer(session_id).await?;
        let projection = writer.projection();

        if let Some(existing) = existing_completion(&projection, writer.events()) {
            info!(session_id, "Module already complete, returning stored summary");
            return Ok(CompletionOutcome {
                summary: existing.1,
                already_complete: true,
                complete_event_seq: existing.0,
                events: writer.into_events(),
            });
        }

        let event = writer
            .append(EventKind::Complete, CompletePayload { summary: summary.clone() })
            .await?;

        info!(
            session_id,
            event_seq = event.event_seq,
            insights = summary.insights.len(),
            "Module complete"
        );

        Ok(CompletionOutcome {
            summary,
            already_complete: false,
            complete_event_seq: event.event_seq,
            events: writer.into_events(),
        })
    }
}

fn existing_completion(
    projection: &SessionProjection,
    events: &[ConversationEvent],
) -> Option<(u64, CompletionSummary)> {
    let seq = events
        .iter()
        .find(|e| e.kind == EventKind::Complete)
        .map(|e| e.event_seq)?;
    projection.summary.clone().map(|summary| (seq, summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use crate::types::MessagePayload;
    use std::sync::Arc;

    fn summary() -> CompletionSummary {
        CompletionSummary {
            insights: vec!["You value autonomy".to_string()],
            assessment: "Clear sense of direction".to_string(),
            takeaway: "Block one focus hour a day".to_string(),
        }
    }

    async fn setup() -> (ProgressTracker, EventLog, String) {
        let log = EventLog::new(Arc::new(MemoryEventStore::new()));
        let session = log.create_session("subject-1", 2).await.unwrap();
        (ProgressTracker::new(log.clone()), log, session.session_id)
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(ProgressTracker::validate_percent(5).unwrap(), 5);
        assert_eq!(ProgressTracker::validate_percent(100).unwrap(), 100);
        assert!(matches!(
            ProgressTracker::validate_percent(4),
            Err(ChatError::InvalidProgress(4))
        ));
        assert!(ProgressTracker::validate_percent(101).is_err());
        assert!(ProgressTracker::validate_percent(-1).is_err());
    }

    #[test]
    fn test_summary_validation() {
        assert!(ProgressTracker::validate_summary(&summary()).is_ok());

        let mut empty = summary();
        empty.insights.clear();
        assert!(ProgressTracker::validate_summary(&empty).is_err());

        let mut blank = summary();
        blank.takeaway = "  ".to_string();
        assert!(matches!(
            ProgressTracker::validate_summary(&blank),
            Err(ChatError::InvalidSummary(_))
        ));
    }

    #[tokio::test]
    async fn test_progress_is_clamped_not_rejected() {
        let (tracker, log, id) = setup().await;

        let mut exposed = Vec::new();
        for percent in [10, 40, 25, 90] {
            exposed.push(tracker.set_progress(&id, percent).await.unwrap().exposed);
        }
        assert_eq!(exposed, vec![10, 40, 40, 90]);

        let events = log.list(&id).await.unwrap();
        let raw: Vec<u8> = events
            .iter()
            .map(|e| e.payload_as::<ProgressPayload>().unwrap().percent)
            .collect();
        assert_eq!(raw, vec![10, 40, 25, 90]);
        assert_eq!(log.project(&id).await.unwrap().progress, Some(90));
    }

    #[tokio::test]
    async fn test_out_of_range_appends_nothing() {
        let (tracker, log, id) = setup().await;
        assert!(tracker.set_progress(&id, 150).await.is_err());
        assert!(log.list(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let (tracker, log, id) = setup().await;

        let first = tracker.complete_module(&id, summary()).await.unwrap();
        assert!(!first.already_complete);

        let mut other = summary();
        other.takeaway = "Something else".to_string();
        let second = tracker.complete_module(&id, other).await.unwrap();
        assert!(second.already_complete);
        assert_eq!(second.summary, summary());
        assert_eq!(second.complete_event_seq, first.complete_event_seq);

        let events = log.list(&id).await.unwrap();
        assert_eq!(events.iter().filter(|e| e.kind == EventKind::Complete).count(), 1);

        let err = log
            .append(&id, EventKind::MessageUser, MessagePayload::user("more"))
            .await
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(matches!(
            tracker.set_progress(&id, 50).await,
            Err(ChatError::SessionComplete(_))
        ));
    }
}

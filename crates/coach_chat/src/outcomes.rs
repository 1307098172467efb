//! Structured outcome coordination.
//!
//! A structured outcomes event offers a set of mutually exclusive options.
//! It is resolved at most once:
//!
//! - the first selection appends `module.outcome_selected` plus a synthetic
//!   `message.user` so the transcript reads naturally
//! - repeating the same option (a network retry) succeeds without appending
//! - choosing a different option afterwards is a `Conflict`
//!
//! The check and the append run under the session lock in one step, so two
//! racing selections can never both observe "unresolved".

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ChatError, ChatResult};
use crate::log::{EventLog, SessionWriter};
use crate::types::{
    ConversationEvent, EventKind, MessagePayload, OutcomeOption, OutcomeSelectedPayload,
    OutcomesAddedPayload,
};

/// Result of presenting outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresentedOutcomes {
    /// Reference handle for later selection
    #[serde(rename = "eventSeq")]
    pub event_seq: u64,
    pub options: Vec<OutcomeOption>,
    pub events: Vec<ConversationEvent>,
}

/// Result of a selection attempt that did not fail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionOutcome {
    #[serde(rename = "outcomesEventSeq")]
    pub outcomes_event_seq: u64,
    #[serde(rename = "optionId")]
    pub option_id: String,
    /// `eventSeq` of the stored `module.outcome_selected`
    #[serde(rename = "selectionEventSeq")]
    pub selection_event_seq: u64,
    /// True when this call was an idempotent repeat and appended nothing
    pub replayed: bool,
    /// Session log as of the decision
    pub events: Vec<ConversationEvent>,
}

/// Manages structured-choice events
#[derive(Clone)]
pub struct OutcomeCoordinator {
    log: EventLog,
}

impl OutcomeCoordinator {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// Check options are non-empty, have unique non-empty ids, and labels
    pub fn validate_options(options: &[OutcomeOption]) -> ChatResult<()> {
        if options.is_empty() {
            return Err(ChatError::InvalidOutcomes("options must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for option in options {
            if option.id.trim().is_empty() {
                return Err(ChatError::InvalidOutcomes("option id must not be empty".to_string()));
            }
            if option.label.trim().is_empty() {
                return Err(ChatError::InvalidOutcomes(format!(
                    "option '{}' has an empty label",
                    option.id
                )));
            }
            if !seen.insert(option.id.as_str()) {
                return Err(ChatError::InvalidOutcomes(format!(
                    "duplicate option id '{}'",
                    option.id
                )));
            }
        }
        Ok(())
    }

    /// Append a `module.structured_outcomes_added` event
    pub async fn present_outcomes(
        &self,
        session_id: &str,
        options: Vec<OutcomeOption>,
    ) -> ChatResult<PresentedOutcomes> {
        Self::validate_options(&options)?;

        let mut writer = self.log.writer(session_id).await?;
        let event = writer
            .append(
                EventKind::StructuredOutcomesAdded,
                OutcomesAddedPayload {
                    options: options.clone(),
                },
            )
            .await?;

        info!(
            session_id,
            event_seq = event.event_seq,
            count = options.len(),
            "Presented structured outcomes"
        );

        Ok(PresentedOutcomes {
            event_seq: event.event_seq,
            options,
            events: writer.into_events(),
        })
    }

    /// Resolve an outcomes event with one of its options
    pub async fn select_outcome(
        &self,
        session_id: &str,
        outcomes_event_seq: u64,
        option_id: &str,
    ) -> ChatResult<SelectionOutcome> {
        let mut writer = self.log.writer(session_id).await?;
        let selection = Self::select_locked(&mut writer, outcomes_event_seq, option_id).await?;

        Ok(SelectionOutcome {
            events: writer.into_events(),
            ..selection
        })
    }

    async fn select_locked(
        writer: &mut SessionWriter,
        outcomes_event_seq: u64,
        option_id: &str,
    ) -> ChatResult<SelectionOutcome> {
        let offered = find_outcomes(writer.events(), outcomes_event_seq).ok_or_else(|| {
            ChatError::OutcomesNotFound {
                session_id: writer.session_id().to_string(),
                event_seq: outcomes_event_seq,
            }
        })?;

        let option = offered
            .option(option_id)
            .cloned()
            .ok_or_else(|| ChatError::InvalidOption {
                event_seq: outcomes_event_seq,
                option_id: option_id.to_string(),
            })?;

        if let Some((selection_seq, prior)) = find_selection(writer.events(), outcomes_event_seq) {
            if prior.option_id == option_id {
                info!(
                    session_id = writer.session_id(),
                    outcomes_event_seq, option_id, "Replayed outcome selection"
                );
                return Ok(SelectionOutcome {
                    outcomes_event_seq,
                    option_id: option.id,
                    selection_event_seq: selection_seq,
                    replayed: true,
                    events: Vec::new(),
                });
            }

            let chosen_label = offered
                .option(&prior.option_id)
                .map(|o| o.label.clone())
                .unwrap_or_else(|| prior.option_id.clone());
            warn!(
                session_id = writer.session_id(),
                outcomes_event_seq,
                chosen = %prior.option_id,
                attempted = option_id,
                "Rejected conflicting outcome selection"
            );
            return Err(ChatError::Conflict {
                outcomes_event_seq,
                chosen_option_id: prior.option_id,
                chosen_label,
            });
        }

        // Selection and its transcript line land together or not at all
        let selected = OutcomeSelectedPayload {
            outcomes_event_seq,
            option_id: option.id.clone(),
            value: option.value.clone(),
        };
        let selection_event_seq = writer.head_seq() + 1;
        writer
            .append_all(vec![
                (EventKind::OutcomeSelected, serde_json::to_value(selected)?),
                (
                    EventKind::MessageUser,
                    serde_json::to_value(MessagePayload::selection(&option.label))?,
                ),
            ])
            .await?;

        info!(
            session_id = writer.session_id(),
            outcomes_event_seq, option_id, "Recorded outcome selection"
        );

        Ok(SelectionOutcome {
            outcomes_event_seq,
            option_id: option.id,
            selection_event_seq,
            replayed: false,
            events: Vec::new(),
        })
    }
}

/// Find the outcomes event with the given `eventSeq`
pub fn find_outcomes(events: &[ConversationEvent], event_seq: u64) -> Option<OutcomesAddedPayload> {
    events
        .iter()
        .find(|e| e.event_seq == event_seq && e.kind == EventKind::StructuredOutcomesAdded)
        .and_then(|e| e.payload_as().ok())
}

/// Find the first selection recorded for an outcomes event
pub fn find_selection(
    events: &[ConversationEvent],
    outcomes_event_seq: u64,
) -> Option<(u64, OutcomeSelectedPayload)> {
    events
        .iter()
        .filter(|e| e.kind == EventKind::OutcomeSelected)
        .filter_map(|e| {
            e.payload_as::<OutcomeSelectedPayload>()
                .ok()
                .map(|p| (e.event_seq, p))
        })
        .find(|(_, p)| p.outcomes_event_seq == outcomes_event_seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use std::sync::Arc;

    fn options() -> Vec<OutcomeOption> {
        vec![
            OutcomeOption::new("mod_opt_1", "Dig deeper", "deeper"),
            OutcomeOption::new("mod_opt_2", "Move on", "move_on"),
        ]
    }

    async fn setup() -> (OutcomeCoordinator, EventLog, String) {
        let log = EventLog::new(Arc::new(MemoryEventStore::new()));
        let session = log.create_session("subject-1", 1).await.unwrap();
        (OutcomeCoordinator::new(log.clone()), log, session.session_id)
    }

    fn count(events: &[ConversationEvent], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    #[test]
    fn test_validate_options() {
        assert!(OutcomeCoordinator::validate_options(&options()).is_ok());
        assert!(matches!(
            OutcomeCoordinator::validate_options(&[]),
            Err(ChatError::InvalidOutcomes(_))
        ));

        let dup = vec![
            OutcomeOption::new("a", "A", "1"),
            OutcomeOption::new("a", "Again", "2"),
        ];
        assert!(OutcomeCoordinator::validate_options(&dup).is_err());
    }

    #[tokio::test]
    async fn test_select_is_idempotent() {
        let (coordinator, log, id) = setup().await;
        let presented = coordinator.present_outcomes(&id, options()).await.unwrap();

        let first = coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_1")
            .await
            .unwrap();
        assert!(!first.replayed);

        let second = coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_1")
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.selection_event_seq, first.selection_event_seq);

        let events = log.list(&id).await.unwrap();
        assert_eq!(count(&events, EventKind::OutcomeSelected), 1);
        assert_eq!(count(&events, EventKind::MessageUser), 1);
    }

    #[tokio::test]
    async fn test_distinct_second_selection_conflicts() {
        let (coordinator, log, id) = setup().await;
        let presented = coordinator.present_outcomes(&id, options()).await.unwrap();

        coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_1")
            .await
            .unwrap();
        let err = coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_2")
            .await
            .unwrap_err();

        match err {
            ChatError::Conflict {
                chosen_option_id,
                chosen_label,
                ..
            } => {
                assert_eq!(chosen_option_id, "mod_opt_1");
                assert_eq!(chosen_label, "Dig deeper");
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let projection = log.project(&id).await.unwrap();
        assert_eq!(projection.resolved_outcomes[0].option_id, "mod_opt_1");
    }

    #[tokio::test]
    async fn test_unknown_seq_and_option() {
        let (coordinator, _, id) = setup().await;
        let presented = coordinator.present_outcomes(&id, options()).await.unwrap();

        let err = coordinator.select_outcome(&id, 999, "mod_opt_1").await.unwrap_err();
        assert!(matches!(err, ChatError::OutcomesNotFound { event_seq: 999, .. }));

        let err = coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_9")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidOption { .. }));
    }

    #[tokio::test]
    async fn test_seq_of_other_kind_is_not_found() {
        let (coordinator, log, id) = setup().await;
        let msg = log
            .append(&id, EventKind::MessageUser, MessagePayload::user("hi"))
            .await
            .unwrap();

        let err = coordinator
            .select_outcome(&id, msg.event_seq, "mod_opt_1")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_failed_selection_leaves_nothing_behind() {
        let store = MemoryEventStore::new();
        let log = EventLog::new(Arc::new(store.clone()));
        let id = log.create_session("subject-1", 1).await.unwrap().session_id;
        let coordinator = OutcomeCoordinator::new(log.clone());
        let presented = coordinator.present_outcomes(&id, options()).await.unwrap();

        // Storage drops out while writing the synthetic user message
        store.fail_next_append_at(presented.event_seq + 2);
        let err = coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(log.list(&id).await.unwrap().len(), 1);

        let retry = coordinator
            .select_outcome(&id, presented.event_seq, "mod_opt_1")
            .await
            .unwrap();
        assert!(!retry.replayed);

        let projection = log.project(&id).await.unwrap();
        let last = projection.transcript.last().unwrap();
        assert_eq!(last.content, "Dig deeper");
        assert_eq!(count(&retry.events, EventKind::OutcomeSelected), 1);
        assert_eq!(count(&retry.events, EventKind::MessageUser), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_distinct_selections_one_wins() {
        let (coordinator, log, id) = setup().await;
        let presented = coordinator.present_outcomes(&id, options()).await.unwrap();

        let mut handles = Vec::new();
        for option in ["mod_opt_1", "mod_opt_2", "mod_opt_1", "mod_opt_2"] {
            let coordinator = coordinator.clone();
            let id = id.clone();
            let seq = presented.event_seq;
            handles.push(tokio::spawn(async move {
                coordinator.select_outcome(&id, seq, option).await
            }));
        }

        let mut fresh = 0;
        let mut replays = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(s) if s.replayed => replays += 1,
                Ok(_) => fresh += 1,
                Err(ChatError::Conflict { .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }

        assert_eq!(fresh, 1);
        assert_eq!(replays, 1);
        assert_eq!(conflicts, 2);
        let events = log.list(&id).await.unwrap();
        assert_eq!(count(&events, EventKind::OutcomeSelected), 1);
    }
}

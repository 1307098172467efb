//! Turn processing.
//!
//! A turn runs one user message through the model producer:
//!
//! ```text
//! idle ──start──▶ generating ──Finished──▶ done
//!                     │
//!                     └──failure / timeout / abrupt end──▶ error
//! ```
//!
//! Fragments are pushed live and buffered; tool calls are dispatched to the
//! outcome coordinator or progress tracker as they arrive. The buffered text
//! becomes one `message.assistant` when the producer finishes. On failure the
//! buffer is discarded and only what was already durable stays.
//!
//! At most one turn runs per session. The in-flight slot is released by a
//! guard, so it is freed whichever way the turn ends. A client that stops
//! reading does not stop the turn.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ChatError, ChatResult};
use crate::log::EventLog;
use crate::outcomes::OutcomeCoordinator;
use crate::producer::{GenerationRequest, ModelProducer, ProducerItem, ProducerStream};
use crate::progress::ProgressTracker;
use crate::tools::{tool_definitions, ToolInvocation};
use crate::transport::{stream_channel, StreamEvent, StreamReceiver, StreamSink};
use crate::types::{EventKind, MessagePayload};

const ABRUPT_END: &str = "model stream ended unexpectedly";

/// Watchdog and transport settings for turns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnConfig {
    /// Longest wait for the next producer item
    pub producer_idle_timeout: Duration,
    /// Longest a whole generation may run
    pub turn_timeout: Duration,
    pub stream_capacity: usize,
    /// Wait for `tool_executed` and terminal frames
    pub important_send_timeout: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            producer_idle_timeout: Duration::from_secs(60),
            turn_timeout: Duration::from_secs(300),
            stream_capacity: crate::transport::DEFAULT_STREAM_CAPACITY,
            important_send_timeout: crate::transport::DEFAULT_IMPORTANT_SEND_TIMEOUT,
        }
    }
}

/// State of one turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Generating,
    Done,
    Error,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// What a finished turn did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReport {
    pub session_id: String,
    pub user_event_seq: u64,
    pub state: TurnState,
    /// Text streamed during the turn
    pub text: String,
    /// `eventSeq` of the stored assistant message, if any
    pub assistant_event_seq: Option<u64>,
    /// Tools dispatched, in order
    pub tools_executed: Vec<String>,
    pub module_complete: bool,
    /// Message sent in the `error` frame
    pub error: Option<String>,
}

/// Handle on a running turn
pub struct TurnHandle {
    user_event_seq: u64,
    stream: StreamReceiver,
    task: JoinHandle<TurnReport>,
}

impl TurnHandle {
    pub fn user_event_seq(&self) -> u64 {
        self.user_event_seq
    }

    /// Split into the live stream and the turn task
    pub fn into_parts(self) -> (StreamReceiver, JoinHandle<TurnReport>) {
        (self.stream, self.task)
    }

    /// Read the stream to its end and wait for the turn
    pub async fn finish(self) -> ChatResult<(Vec<StreamEvent>, TurnReport)> {
        let events = self.stream.collect().await;
        let report = join_report(self.task).await?;
        Ok((events, report))
    }

    /// Drop the client side and wait for the turn
    pub async fn abandon(self) -> ChatResult<TurnReport> {
        drop(self.stream);
        join_report(self.task).await
    }
}

async fn join_report(task: JoinHandle<TurnReport>) -> ChatResult<TurnReport> {
    task.await
        .map_err(|e| ChatError::Producer(format!("turn task failed: {}", e)))
}

/// Releases a session's in-flight slot on drop
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl InFlightGuard {
    fn acquire(in_flight: &Arc<Mutex<HashSet<String>>>, session_id: &str) -> ChatResult<Self> {
        if !in_flight.lock().insert(session_id.to_string()) {
            return Err(ChatError::TurnInProgress(session_id.to_string()));
        }
        Ok(Self {
            in_flight: in_flight.clone(),
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.session_id);
        debug!(session_id = %self.session_id, "Released in-flight turn slot");
    }
}

/// A turn that passed admission and has its user message stored
struct PreparedTurn {
    guard: InFlightGuard,
    user_event_seq: u64,
    request: GenerationRequest,
}

/// Mutable state of a generating turn
struct TurnRun {
    session_id: String,
    state: TurnState,
    /// Text not yet stored as `message.assistant`
    pending: String,
    text: String,
    assistant_event_seq: Option<u64>,
    tools_executed: Vec<String>,
    module_complete: bool,
}

/// Drives assistant turns
#[derive(Clone)]
pub struct TurnProcessor {
    log: EventLog,
    outcomes: OutcomeCoordinator,
    progress: ProgressTracker,
    producer: Arc<dyn ModelProducer>,
    config: TurnConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl TurnProcessor {
    pub fn new(log: EventLog, producer: Arc<dyn ModelProducer>, config: TurnConfig) -> Self {
        Self {
            outcomes: OutcomeCoordinator::new(log.clone()),
            progress: ProgressTracker::new(log.clone()),
            log,
            producer,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &TurnConfig {
        &self.config
    }

    /// Whether a turn is running for the session
    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.in_flight.lock().contains(session_id)
    }

    /// Admit a turn, store the user message and run the turn on its own task.
    ///
    /// Admission errors (session complete, turn in flight, storage down) are
    /// returned here; everything after surfaces as stream frames.
    pub async fn start_turn(&self, session_id: &str, user_text: &str) -> ChatResult<TurnHandle> {
        let prepared = self.prepare(session_id, user_text).await?;
        let (sink, stream) =
            stream_channel(self.config.stream_capacity, self.config.important_send_timeout);

        let user_event_seq = prepared.user_event_seq;
        let processor = self.clone();
        let task = tokio::spawn(async move { processor.drive(prepared, sink).await });

        Ok(TurnHandle {
            user_event_seq,
            stream,
            task,
        })
    }

    /// Run a turn to completion on the current task, streaming into `sink`
    pub async fn run_turn(
        &self,
        session_id: &str,
        user_text: &str,
        sink: StreamSink,
    ) -> ChatResult<TurnReport> {
        let prepared = self.prepare(session_id, user_text).await?;
        Ok(self.drive(prepared, sink).await)
    }

    async fn prepare(&self, session_id: &str, user_text: &str) -> ChatResult<PreparedTurn> {
        let guard = InFlightGuard::acquire(&self.in_flight, session_id)?;

        let mut writer = self.log.writer(session_id).await?;
        if writer.is_complete() {
            return Err(ChatError::SessionComplete(session_id.to_string()));
        }
        let user_event = writer
            .append(EventKind::MessageUser, MessagePayload::user(user_text))
            .await?;
        let projection = writer.projection();
        drop(writer);

        Ok(PreparedTurn {
            guard,
            user_event_seq: user_event.event_seq,
            request: GenerationRequest {
                session_id: session_id.to_string(),
                module_number: projection.session.module_number,
                transcript: projection.transcript,
                tools: tool_definitions(),
            },
        })
    }

    async fn drive(&self, prepared: PreparedTurn, sink: StreamSink) -> TurnReport {
        let PreparedTurn {
            guard,
            user_event_seq,
            request,
        } = prepared;

        let mut run = TurnRun {
            session_id: request.session_id.clone(),
            state: TurnState::Idle,
            pending: String::new(),
            text: String::new(),
            assistant_event_seq: None,
            tools_executed: Vec::new(),
            module_complete: false,
        };

        run.state = TurnState::Generating;
        info!(
            session_id = %run.session_id,
            producer = self.producer.name(),
            user_event_seq,
            "Turn started"
        );

        let result = self.generate(&mut run, request, &sink).await;

        let terminal = match result {
            Ok(()) => {
                run.state = TurnState::Done;
                StreamEvent::Done {
                    assistant_event_seq: run.assistant_event_seq,
                    module_complete: run.module_complete,
                }
            }
            Err(e) => {
                run.state = TurnState::Error;
                warn!(session_id = %run.session_id, "Turn failed: {}", e);
                StreamEvent::error(stream_error_message(&e))
            }
        };

        let error = match &terminal {
            StreamEvent::Error { error } => Some(error.clone()),
            _ => None,
        };
        sink.send_important(terminal).await;

        info!(
            session_id = %run.session_id,
            state = ?run.state,
            tools = run.tools_executed.len(),
            module_complete = run.module_complete,
            "Turn finished"
        );
        drop(guard);

        TurnReport {
            session_id: run.session_id,
            user_event_seq,
            state: run.state,
            text: run.text,
            assistant_event_seq: run.assistant_event_seq,
            tools_executed: run.tools_executed,
            module_complete: run.module_complete,
            error,
        }
    }

    async fn generate(
        &self,
        run: &mut TurnRun,
        request: GenerationRequest,
        sink: &StreamSink,
    ) -> ChatResult<()> {
        let deadline = Instant::now() + self.config.turn_timeout;

        let mut stream = self
            .with_watchdog(deadline, self.producer.generate(request))
            .await??;

        loop {
            match self.next_item(&mut stream, deadline).await? {
                Some(ProducerItem::Fragment(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    sink.send_delta(text.as_str());
                    run.pending.push_str(&text);
                    run.text.push_str(&text);
                }
                Some(ProducerItem::ToolCall { name, arguments }) => {
                    let refetch_events = self.execute_tool(run, &name, &arguments).await?;
                    run.tools_executed.push(name.clone());
                    sink.send_important(StreamEvent::ToolExecuted {
                        tool_name: name,
                        refetch_events,
                    })
                    .await;
                }
                Some(ProducerItem::Finished) => break,
                None => return Err(ChatError::Producer(ABRUPT_END.to_string())),
            }
        }

        self.flush_assistant(run).await
    }

    async fn next_item(
        &self,
        stream: &mut ProducerStream,
        deadline: Instant,
    ) -> ChatResult<Option<ProducerItem>> {
        match self.with_watchdog(deadline, stream.next()).await? {
            Some(item) => item.map(Some),
            None => Ok(None),
        }
    }

    /// Bound a producer wait by the idle timeout and the turn deadline
    async fn with_watchdog<F: std::future::Future>(
        &self,
        deadline: Instant,
        future: F,
    ) -> ChatResult<F::Output> {
        let idle_deadline = Instant::now() + self.config.producer_idle_timeout;
        let limit = idle_deadline.min(deadline);

        tokio::time::timeout_at(limit, future).await.map_err(|_| {
            let waited = if limit == deadline {
                self.config.turn_timeout
            } else {
                self.config.producer_idle_timeout
            };
            ChatError::ProducerTimeout(waited.as_secs())
        })
    }

    /// Dispatch one tool call. Returns whether clients should refetch.
    ///
    /// Malformed or rejected calls are logged and skipped. Only transient
    /// failures end the turn.
    async fn execute_tool(&self, run: &mut TurnRun, name: &str, arguments: &Value) -> ChatResult<bool> {
        let invocation = match ToolInvocation::parse(name, arguments) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!(session_id = %run.session_id, tool = name, "Skipping malformed tool call: {}", e);
                return Ok(false);
            }
        };

        match self.dispatch(run, invocation).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                warn!(session_id = %run.session_id, tool = name, "Tool call rejected: {}", e);
                Ok(false)
            }
        }
    }

    async fn dispatch(&self, run: &mut TurnRun, invocation: ToolInvocation) -> ChatResult<()> {
        let session_id = run.session_id.clone();
        match invocation {
            ToolInvocation::AppendOutcomes { options } => {
                self.outcomes.present_outcomes(&session_id, options).await?;
            }
            ToolInvocation::SetProgress { percent } => {
                self.progress.set_progress(&session_id, percent).await?;
            }
            ToolInvocation::CompleteModule { summary } => {
                ProgressTracker::validate_summary(&summary)?;
                // Text streamed so far must land before the log closes
                self.flush_assistant(run).await?;
                self.progress.complete_module(&session_id, summary).await?;
                run.module_complete = true;
            }
        }
        Ok(())
    }

    /// Store buffered text as one `message.assistant`
    async fn flush_assistant(&self, run: &mut TurnRun) -> ChatResult<()> {
        if run.pending.is_empty() {
            return Ok(());
        }

        if run.module_complete {
            debug!(
                session_id = %run.session_id,
                chars = run.pending.len(),
                "Module complete, streamed closing text is not stored"
            );
            run.pending.clear();
            return Ok(());
        }

        let content = std::mem::take(&mut run.pending);
        let event = self
            .log
            .append(&run.session_id, EventKind::MessageAssistant, MessagePayload::assistant(content))
            .await?;
        run.assistant_event_seq = Some(event.event_seq);
        Ok(())
    }
}

/// Short text for the `error` frame
fn stream_error_message(err: &ChatError) -> String {
    match err {
        ChatError::ProducerTimeout(_) => "model response timed out".to_string(),
        ChatError::Producer(message) if message == ABRUPT_END => ABRUPT_END.to_string(),
        ChatError::Producer(_) => "model request failed".to_string(),
        ChatError::StorageUnavailable(_) => "storage unavailable".to_string(),
        other => other.user_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ScriptStep, ScriptedProducer};
    use crate::store::MemoryEventStore;
    use crate::transport::StreamAccumulator;
    use crate::types::CompletePayload;
    use serde_json::json;

    fn fast_config() -> TurnConfig {
        TurnConfig {
            producer_idle_timeout: Duration::from_millis(200),
            turn_timeout: Duration::from_secs(5),
            stream_capacity: 64,
            important_send_timeout: Duration::from_millis(100),
        }
    }

    async fn setup(producer: ScriptedProducer) -> (TurnProcessor, EventLog, String) {
        let (processor, log, id, _) = setup_with_store(producer).await;
        (processor, log, id)
    }

    async fn setup_with_store(
        producer: ScriptedProducer,
    ) -> (TurnProcessor, EventLog, String, MemoryEventStore) {
        let store = MemoryEventStore::new();
        let log = EventLog::new(Arc::new(store.clone()));
        let session = log.create_session("subject-1", 1).await.unwrap();
        let processor = TurnProcessor::new(log.clone(), Arc::new(producer), fast_config());
        (processor, log, session.session_id, store)
    }

    fn accumulate(events: Vec<StreamEvent>) -> StreamAccumulator {
        let mut acc = StreamAccumulator::new();
        for event in events {
            acc.apply(event);
        }
        acc
    }

    #[tokio::test]
    async fn test_streamed_text_becomes_one_message() {
        let producer = ScriptedProducer::new().with_reply(&["Hel", "lo"]);
        let (processor, log, id) = setup(producer.clone()).await;

        let handle = processor.start_turn(&id, "Hi coach").await.unwrap();
        assert_eq!(handle.user_event_seq(), 1);
        let (events, report) = handle.finish().await.unwrap();

        let acc = accumulate(events);
        assert_eq!(acc.text(), "Hello");
        assert!(matches!(
            acc.terminal(),
            Some(StreamEvent::Done { assistant_event_seq: Some(2), module_complete: false })
        ));
        assert_eq!(report.state, TurnState::Done);

        let events = log.list(&id).await.unwrap();
        let assistant: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::MessageAssistant)
            .collect();
        assert_eq!(assistant.len(), 1);
        assert_eq!(assistant[0].payload["content"], "Hello");

        let request = &producer.requests()[0];
        assert_eq!(request.transcript.last().unwrap().content, "Hi coach");
        assert_eq!(request.tools.len(), 3);
        assert!(!processor.is_in_flight(&id));
    }

    #[tokio::test]
    async fn test_tool_calls_dispatch_and_malformed_is_skipped() {
        let producer = ScriptedProducer::new().with_script(vec![
            ScriptStep::fragment("Pick one."),
            ScriptStep::tool_call(
                "append_structured_outcomes",
                json!({"options": [
                    {"id": "mod_opt_1", "label": "A", "value": "a"},
                    {"id": "mod_opt_2", "label": "B", "value": "b"}
                ]}),
            ),
            ScriptStep::tool_call("set_progress", json!({"percent": "lots"})),
            ScriptStep::tool_call("set_progress", json!({"percent": 30})),
            ScriptStep::Finish,
        ]);
        let (processor, log, id) = setup(producer).await;

        let (events, report) = processor.start_turn(&id, "go").await.unwrap().finish().await.unwrap();
        let acc = accumulate(events);

        assert_eq!(
            acc.tools(),
            &[
                ("append_structured_outcomes".to_string(), true),
                ("set_progress".to_string(), false),
                ("set_progress".to_string(), true),
            ]
        );
        assert_eq!(report.state, TurnState::Done);

        let projection = log.project(&id).await.unwrap();
        assert_eq!(projection.pending_outcomes.len(), 1);
        assert_eq!(projection.progress, Some(30));
        assert_eq!(projection.transcript.last().unwrap().content, "Pick one.");
    }

    #[tokio::test]
    async fn test_abrupt_end_appends_no_assistant_message() {
        let producer = ScriptedProducer::new().with_script(vec![ScriptStep::fragment("half a tho")]);
        let (processor, log, id) = setup(producer).await;

        let (events, report) = processor.start_turn(&id, "hi").await.unwrap().finish().await.unwrap();
        let acc = accumulate(events);

        assert_eq!(acc.error(), Some(ABRUPT_END));
        assert_eq!(report.state, TurnState::Error);
        let events = log.list(&id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::MessageUser);
    }

    #[tokio::test]
    async fn test_stalled_producer_hits_watchdog() {
        let producer = ScriptedProducer::new()
            .with_script(vec![ScriptStep::fragment("thinking"), ScriptStep::Stall { ms: None }]);
        let (processor, _, id) = setup(producer).await;

        let (events, report) = processor.start_turn(&id, "hi").await.unwrap().finish().await.unwrap();
        assert_eq!(accumulate(events).error(), Some("model response timed out"));
        assert_eq!(report.state, TurnState::Error);
        assert!(!processor.is_in_flight(&id));
    }

    #[tokio::test]
    async fn test_second_turn_rejected_while_in_flight() {
        let producer = ScriptedProducer::new()
            .with_script(vec![ScriptStep::Stall { ms: Some(100) }, ScriptStep::Finish])
            .with_reply(&["again"]);
        let (processor, _, id) = setup(producer).await;

        let first = processor.start_turn(&id, "one").await.unwrap();
        let err = processor.start_turn(&id, "two").await.err().unwrap();
        assert!(matches!(err, ChatError::TurnInProgress(_)));
        assert_eq!(err.status_code(), 423);

        first.finish().await.unwrap();
        let (_, report) = processor.start_turn(&id, "three").await.unwrap().finish().await.unwrap();
        assert_eq!(report.text, "again");
    }

    #[tokio::test]
    async fn test_turn_survives_client_disconnect() {
        let producer = ScriptedProducer::new().with_script(vec![
            ScriptStep::fragment("Hel"),
            ScriptStep::Stall { ms: Some(20) },
            ScriptStep::fragment("lo"),
            ScriptStep::Finish,
        ]);
        let (processor, log, id) = setup(producer).await;

        let report = processor.start_turn(&id, "hi").await.unwrap().abandon().await.unwrap();
        assert_eq!(report.state, TurnState::Done);

        let projection = log.project(&id).await.unwrap();
        assert_eq!(projection.transcript.last().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn test_completing_turn_flushes_text_first() {
        let producer = ScriptedProducer::new().with_script(vec![
            ScriptStep::fragment("Great work."),
            ScriptStep::tool_call(
                "complete_module",
                json!({"summary": {"insights": ["i"], "assessment": "a", "takeaway": "t"}}),
            ),
            ScriptStep::fragment(" Bye!"),
            ScriptStep::Finish,
        ]);
        let (processor, log, id) = setup(producer).await;

        let (events, report) = processor.start_turn(&id, "done?").await.unwrap().finish().await.unwrap();
        assert!(report.module_complete);
        assert_eq!(accumulate(events).text(), "Great work. Bye!");

        let events = log.list(&id).await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EventKind::MessageUser, EventKind::MessageAssistant, EventKind::Complete]
        );
        let payload: CompletePayload = events[2].payload_as().unwrap();
        assert_eq!(payload.summary.takeaway, "t");

        let err = processor.start_turn(&id, "more").await.err().unwrap();
        assert!(matches!(err, ChatError::SessionComplete(_)));
    }

    #[tokio::test]
    async fn test_generate_failure_releases_slot() {
        let producer = ScriptedProducer::new().simulate_failure("connection refused");
        let (processor, log, id) = setup(producer).await;

        let (events, _) = processor.start_turn(&id, "hi").await.unwrap().finish().await.unwrap();
        assert_eq!(accumulate(events).error(), Some("model request failed"));
        assert!(!processor.is_in_flight(&id));
        assert_eq!(log.list(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_during_tool_ends_turn() {
        let producer = ScriptedProducer::new()
            .with_script(vec![
                ScriptStep::tool_call(
                    "append_structured_outcomes",
                    json!({"options": [{"id": "mod_opt_1", "label": "A", "value": "a"}]}),
                ),
                ScriptStep::fragment("never stored"),
                ScriptStep::Finish,
            ])
            .with_reply(&["recovered"]);
        let (processor, log, id, store) = setup_with_store(producer).await;

        // The user message is eventSeq 1, the outcomes event would be 2
        store.fail_next_append_at(2);
        let (events, report) = processor.start_turn(&id, "hi").await.unwrap().finish().await.unwrap();

        let acc = accumulate(events);
        assert_eq!(acc.error(), Some("storage unavailable"));
        assert!(acc.tools().is_empty());
        assert_eq!(report.state, TurnState::Error);
        assert!(!processor.is_in_flight(&id));
        assert_eq!(log.list(&id).await.unwrap().len(), 1);

        let (_, report) = processor.start_turn(&id, "again").await.unwrap().finish().await.unwrap();
        assert_eq!(report.state, TurnState::Done);
    }

    #[tokio::test]
    async fn test_rejected_tool_calls_do_not_stop_the_turn() {
        let producer = ScriptedProducer::new().with_script(vec![
            ScriptStep::tool_call(
                "append_structured_outcomes",
                json!({"options": [
                    {"id": "mod_opt_1", "label": "A", "value": "a"},
                    {"id": "mod_opt_1", "label": "B", "value": "b"}
                ]}),
            ),
            ScriptStep::tool_call(
                "complete_module",
                json!({"summary": {"insights": ["i"], "assessment": "a", "takeaway": "t"}}),
            ),
            ScriptStep::tool_call("set_progress", json!({"percent": 50})),
            ScriptStep::Finish,
        ]);
        let (processor, log, id) = setup(producer).await;

        let (events, report) = processor.start_turn(&id, "wrap up").await.unwrap().finish().await.unwrap();
        let acc = accumulate(events);

        assert_eq!(
            acc.tools(),
            &[
                ("append_structured_outcomes".to_string(), false),
                ("complete_module".to_string(), true),
                ("set_progress".to_string(), false),
            ]
        );
        assert!(matches!(
            acc.terminal(),
            Some(StreamEvent::Done { assistant_event_seq: None, module_complete: true })
        ));
        assert_eq!(report.state, TurnState::Done);

        let kinds: Vec<EventKind> = log.list(&id).await.unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::MessageUser, EventKind::Complete]);
    }

    #[tokio::test]
    async fn test_whitespace_reply_is_stored() {
        let producer = ScriptedProducer::new().with_reply(&["  ", "\n"]);
        let (processor, log, id) = setup(producer).await;

        let (events, _) = processor.start_turn(&id, "hi").await.unwrap().finish().await.unwrap();
        assert!(matches!(
            accumulate(events).terminal(),
            Some(StreamEvent::Done { assistant_event_seq: Some(2), .. })
        ));

        let events = log.list(&id).await.unwrap();
        assert_eq!(events[1].kind, EventKind::MessageAssistant);
        assert_eq!(events[1].payload["content"], "  \n");
    }
}

//! Live stream transport.
//!
//! Turns live turn events into `data: <JSON>\n\n` wire frames for the one
//! client subscribed to a turn. Nothing here is durable: a client that drops
//! mid-turn rebuilds its view from the event log.
//!
//! Sends never stall the turn. `text_delta` frames are dropped when the
//! channel is full; `tool_executed` and terminal frames wait a bounded time.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use eventsource_stream::{EventStream, Eventsource};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};

/// Default channel capacity
pub const DEFAULT_STREAM_CAPACITY: usize = 128;
/// Default wait for a tool or terminal frame
pub const DEFAULT_IMPORTANT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

const FALLBACK_ERROR_FRAME: &str = "data: {\"type\":\"error\",\"error\":\"frame encoding failed\"}\n\n";

/// One live event of an in-flight turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta {
        content: String,
    },
    ToolExecuted {
        #[serde(rename = "toolName")]
        tool_name: String,
        /// Whether the client should re-read the event log
        #[serde(rename = "refetchEvents")]
        refetch_events: bool,
    },
    Done {
        /// `eventSeq` of the stored `message.assistant`, when one was stored
        #[serde(
            rename = "assistantEventSeq",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        assistant_event_seq: Option<u64>,
        #[serde(rename = "moduleComplete", default)]
        module_complete: bool,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    pub fn text_delta(content: impl Into<String>) -> Self {
        Self::TextDelta {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// `done` and `error` end the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TextDelta { .. } => "text_delta",
            Self::ToolExecuted { .. } => "tool_executed",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    /// Encode as a wire frame
    pub fn to_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {}\n\n", json),
            Err(e) => {
                warn!("Failed to encode {} frame: {}", self.type_name(), e);
                FALLBACK_ERROR_FRAME.to_string()
            }
        }
    }
}

/// Create a connected sink/receiver pair
pub fn stream_channel(capacity: usize, important_timeout: Duration) -> (StreamSink, StreamReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        StreamSink {
            tx,
            important_timeout,
            closed_logged: Arc::new(AtomicBool::new(false)),
        },
        StreamReceiver { rx },
    )
}

/// Turn-side end of the transport
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    important_timeout: Duration,
    closed_logged: Arc<AtomicBool>,
}

impl StreamSink {
    /// Best-effort send: never waits, drops the frame if the channel is full
    pub fn send_delta(&self, content: impl Into<String>) {
        match self.tx.try_send(StreamEvent::text_delta(content)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Dropped text_delta frame, client is not keeping up"),
            Err(TrySendError::Closed(_)) => self.note_closed(),
        }
    }

    /// Bounded send for frames the client should see.
    ///
    /// Returns whether the frame was delivered to the channel.
    pub async fn send_important(&self, event: StreamEvent) -> bool {
        let kind = event.type_name();
        match self.tx.send_timeout(event, self.important_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "Dropped {} frame after {:?}, client is not reading",
                    kind, self.important_timeout
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.note_closed();
                false
            }
        }
    }

    /// Whether the client has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn note_closed(&self) {
        if !self.closed_logged.swap(true, Ordering::SeqCst) {
            debug!("Stream receiver closed, continuing turn without a client");
        }
    }
}

/// Client-side end of the transport
pub struct StreamReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamReceiver {
    /// Next live event; `None` once the turn is over
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Live events, ending after the terminal frame
    pub fn into_events(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        stream::unfold((self.rx, false), |(mut rx, finished)| async move {
            if finished {
                return None;
            }
            let event = rx.recv().await?;
            let finished = event.is_terminal();
            Some((event, (rx, finished)))
        })
    }

    /// Wire frames, ending after the terminal frame
    pub fn into_frames(self) -> impl Stream<Item = String> + Send + 'static {
        use futures::StreamExt;
        self.into_events().map(|event| event.to_frame())
    }

    /// Drain every remaining event
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}

/// Client-side parser turning a byte stream of wire frames back into
/// events, whatever the chunk boundaries. Comments and empty frames are
/// skipped; a frame that is not a valid event yields an error and decoding
/// continues.
pub struct FrameDecoder<S> {
    inner: EventStream<S>,
}

impl<S> FrameDecoder<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, B, E> Stream for FrameDecoder<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    type Item = ChatResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if event.data.trim().is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(serde_json::from_str(&event.data).map_err(Into::into)));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(ChatError::Transport(format!(
                        "SSE stream error: {}",
                        e
                    )))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Client-side view of one turn's stream
#[derive(Debug, Default, Clone)]
pub struct StreamAccumulator {
    text: String,
    tools: Vec<(String, bool)>,
    terminal: Option<StreamEvent>,
    ignored_after_terminal: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event; events after the terminal frame are counted and ignored
    pub fn apply(&mut self, event: StreamEvent) {
        if self.terminal.is_some() {
            self.ignored_after_terminal += 1;
            return;
        }
        match event {
            StreamEvent::TextDelta { content } => self.text.push_str(&content),
            StreamEvent::ToolExecuted {
                tool_name,
                refetch_events,
            } => self.tools.push((tool_name, refetch_events)),
            terminal => self.terminal = Some(terminal),
        }
    }

    /// Concatenated `text_delta` content
    pub fn text(&self) -> &str {
        &self.text
    }

    /// `(toolName, refetchEvents)` per executed tool
    pub fn tools(&self) -> &[(String, bool)] {
        &self.tools
    }

    /// Whether any executed tool asked for a refetch
    pub fn needs_refetch(&self) -> bool {
        self.tools.iter().any(|(_, refetch)| *refetch)
    }

    pub fn terminal(&self) -> Option<&StreamEvent> {
        self.terminal.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.terminal.is_some()
    }

    /// Error message when the stream ended with `error`
    pub fn error(&self) -> Option<&str> {
        match &self.terminal {
            Some(StreamEvent::Error { error }) => Some(error),
            _ => None,
        }
    }

    pub fn ignored_after_terminal(&self) -> usize {
        self.ignored_after_terminal
    }
}

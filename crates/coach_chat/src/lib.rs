//! # coach_chat - Conversation Event Protocol for Coaching Modules
//!
//! This crate provides the event/streaming core behind module conversations:
//! - An append-only, gap-free event log per session
//! - Streamed assistant turns with live `text_delta` frames
//! - Structured outcomes resolved exactly once (idempotent replay, conflicts)
//! - Monotonic progress and a terminal completion with a summary
//!
//! ## Key Features
//!
//! - **Pure Replay**: Every read view is a fold over the event log
//! - **Per-Session Serialization**: One append and one turn at a time per session
//! - **Best-Effort Transport**: A slow or vanished client never stalls a turn
//! - **Pluggable Producer**: Scripted producer for tests, OpenAI-compatible for real runs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  CoachService   │────▶│  TurnProcessor  │────▶│  ModelProducer  │
//! └────────┬────────┘     └────────┬────────┘     └─────────────────┘
//!          │                       │  text_delta / tool_executed / done
//!          │              ┌────────┴────────┐     ┌─────────────────┐
//!          │              ▼                 └────▶│   StreamSink    │
//! ┌─────────────────┐  ┌─────────────────┐        └─────────────────┘
//! │OutcomeCoordinator│ │ ProgressTracker │
//! └────────┬────────┘  └────────┬────────┘
//!          └──────────┬─────────┘
//!                     ▼
//!            ┌─────────────────┐     ┌─────────────────┐
//!            │    EventLog     │────▶│   EventStore    │
//!            │ (+ projection)  │     │ memory / JSONL  │
//!            └─────────────────┘     └─────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod llm;
pub mod log;
pub mod mock;
pub mod outcomes;
pub mod persistence;
pub mod producer;
pub mod progress;
pub mod projection;
pub mod service;
pub mod store;
pub mod tools;
pub mod transport;
pub mod turn;
pub mod types;

pub use config::*;
pub use error::*;
pub use llm::*;
pub use log::*;
pub use mock::*;
pub use outcomes::*;
pub use persistence::*;
pub use producer::*;
pub use progress::*;
pub use projection::{fold, PendingOutcomes, ProgressPoint, ResolvedOutcome, SessionProjection, TranscriptEntry};
pub use service::*;
pub use store::*;
pub use tools::*;
pub use transport::*;
pub use turn::*;
pub use types::*;

//! CLI command definitions.
//!
//! Each subcommand maps onto one operation of the conversation protocol.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;

use coach_chat::{CoachConfig, CoachService, ModelProducer, ScriptedProducer};

pub mod outcomes;
pub mod progress;
pub mod say;
pub mod session;
pub mod state;

/// coach - operator CLI for coaching module conversations
#[derive(Parser)]
#[command(name = "coach")]
#[command(version, about = "Operator CLI for coaching module conversations")]
#[command(long_about = r#"
Drives the conversation event protocol of a coaching module against the
local event store.

WORKFLOW:
  enter     → Create or resume the session for a subject and module
  say       → Run a streamed turn and print the wire frames
  present   → Offer structured outcomes
  select    → Resolve structured outcomes with one option
  progress  → Report module progress
  complete  → Finish the module with a summary
  state     → Print the folded session state
  events    → Print the raw event log

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments or unknown session/outcome
  3 - Selection conflict
  4 - Protocol violation
  5 - Transient failure
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory holding config.toml and sessions/
    #[arg(long, global = true, env = "COACH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or resume the session for a subject and module
    Enter(session::EnterArgs),

    /// List sessions
    Sessions(session::SessionsArgs),

    /// Send a user message and stream the assistant turn
    Say(say::SayArgs),

    /// Offer structured outcomes
    Present(outcomes::PresentArgs),

    /// Select a structured outcome
    Select(outcomes::SelectArgs),

    /// Report module progress
    Progress(progress::ProgressArgs),

    /// Complete the module with a summary
    Complete(progress::CompleteArgs),

    /// Print the folded session state
    State(state::StateArgs),

    /// Print the session's events
    Events(state::EventsArgs),
}

/// Service for commands that never run a turn
pub fn open_service(config: &CoachConfig) -> CoachService {
    // Producer is unused here; an empty script fails loudly if it ever is
    open_service_with(config, Arc::new(ScriptedProducer::new()))
}

pub fn open_service_with(config: &CoachConfig, producer: Arc<dyn ModelProducer>) -> CoachService {
    CoachService::from_config(config, producer)
}

/// Pretty-print a response as JSON
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

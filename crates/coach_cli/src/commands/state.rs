//! State commands - Read the folded state or the raw event log.

use anyhow::Result;
use clap::Args;

use coach_chat::{CoachConfig, ReadStateRequest};

use super::{open_service, print_json};

#[derive(Args)]
pub struct StateArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,
}

#[derive(Args)]
pub struct EventsArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,

    /// Only print events after this eventSeq
    #[arg(long, default_value_t = 0)]
    pub after: u64,
}

pub async fn show(args: StateArgs, config: &CoachConfig) -> Result<()> {
    let service = open_service(config);
    let response = service
        .read_state(ReadStateRequest {
            session_id: args.session,
        })
        .await?;
    print_json(&response)
}

/// Print one JSON event per line
pub async fn events(args: EventsArgs, config: &CoachConfig) -> Result<()> {
    let service = open_service(config);
    let events = service.list_events(&args.session).await?;

    for event in events.iter().filter(|e| e.event_seq > args.after) {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

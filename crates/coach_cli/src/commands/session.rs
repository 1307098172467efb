//! Session commands - Enter a module and list sessions.

use anyhow::Result;
use clap::Args;
use tracing::info;

use coach_chat::{CoachConfig, EnterModuleRequest, SessionPhase};

use super::{open_service, print_json};

#[derive(Args)]
pub struct EnterArgs {
    /// Owner of the session
    #[arg(short, long)]
    pub subject: String,

    /// Module number
    #[arg(short, long)]
    pub module: u32,

    /// Print the response as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct SessionsArgs {
    /// Only list sessions of this subject
    #[arg(short, long)]
    pub subject: Option<String>,
}

pub async fn enter(args: EnterArgs, config: &CoachConfig) -> Result<()> {
    info!("Entering module {} for {}", args.module, args.subject);

    let service = open_service(config);
    let response = service
        .enter_module(EnterModuleRequest {
            subject_id: args.subject,
            module_number: args.module,
        })
        .await?;

    if args.json {
        return print_json(&response);
    }

    let session = response.session;
    println!("✅ Session {}", session.session_id);
    println!("   Module: {}", session.module_number);
    println!("   Phase:  {}", phase_label(session.phase));
    Ok(())
}

pub async fn list(args: SessionsArgs, config: &CoachConfig) -> Result<()> {
    let service = open_service(config);
    let sessions = service.log().list_sessions().await?;

    let sessions: Vec<_> = sessions
        .into_iter()
        .filter(|s| args.subject.as_ref().map_or(true, |subject| &s.subject_id == subject))
        .collect();

    if sessions.is_empty() {
        println!("No sessions found in {:?}", config.data_dir);
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  module {:>2}  {:<8}  {}  {}",
            session.session_id,
            session.module_number,
            phase_label(session.phase),
            session.subject_id,
            session.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn phase_label(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Active => "active",
        SessionPhase::Complete => "complete",
    }
}

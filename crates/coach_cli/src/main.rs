//! coach CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments or unknown session/outcome
//! - 3: Selection conflict
//! - 4: Protocol violation (module complete, turn in progress)
//! - 5: Transient failure (storage or model unavailable), safe to retry

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use coach_chat::{ChatError, CoachConfig};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const CONFLICT: u8 = 3;
    pub const PROTOCOL_VIOLATION: u8 = 4;
    pub const TRANSIENT: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "coach=debug" } else { "coach=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},warn", default_level)));
    let log_result = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();

    if log_result.is_err() {
        // Logging already initialized, continue
    }

    let config = match CoachConfig::load(cli.data_dir.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            return ExitCode::from(ExitCodes::GENERAL_ERROR);
        }
    };

    let result = match cli.command {
        Commands::Enter(args) => commands::session::enter(args, &config).await,
        Commands::Sessions(args) => commands::session::list(args, &config).await,
        Commands::Say(args) => commands::say::execute(args, &config).await,
        Commands::Present(args) => commands::outcomes::present(args, &config).await,
        Commands::Select(args) => commands::outcomes::select(args, &config).await,
        Commands::Progress(args) => commands::progress::set(args, &config).await,
        Commands::Complete(args) => commands::progress::complete(args, &config).await,
        Commands::State(args) => commands::state::show(args, &config).await,
        Commands::Events(args) => commands::state::events(args, &config).await,
    };

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            match e.downcast_ref::<ChatError>() {
                Some(chat) => eprintln!("❌ {} ({})", chat.user_message(), chat),
                None => eprintln!("❌ Error: {:#}", e),
            }
            ExitCode::from(exit_code)
        }
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    if let Some(chat) = e.downcast_ref::<ChatError>() {
        return match chat {
            ChatError::Conflict { .. } => ExitCodes::CONFLICT,
            _ if chat.is_retryable() => ExitCodes::TRANSIENT,
            ChatError::SessionComplete(_) | ChatError::TurnInProgress(_) => {
                ExitCodes::PROTOCOL_VIOLATION
            }
            _ if matches!(chat.status_code(), 400 | 404 | 422) => ExitCodes::INVALID_ARGS,
            _ => ExitCodes::GENERAL_ERROR,
        };
    }

    let msg = e.to_string().to_lowercase();
    if msg.contains("argument") || msg.contains("invalid") || msg.contains("not found") {
        ExitCodes::INVALID_ARGS
    } else {
        ExitCodes::GENERAL_ERROR
    }
}

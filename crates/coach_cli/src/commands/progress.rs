//! Progress commands - Report progress and complete a module.

use anyhow::Result;
use clap::Args;

use coach_chat::{CoachConfig, CompleteModuleRequest, CompletionSummary, SetProgressRequest};

use super::{open_service, print_json};

#[derive(Args)]
pub struct ProgressArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,

    /// Module number of the session
    #[arg(short, long)]
    pub module: u32,

    /// Percent complete (5-100)
    #[arg(short, long, allow_negative_numbers = true)]
    pub percent: i64,
}

#[derive(Args)]
pub struct CompleteArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,

    /// Module number of the session
    #[arg(short, long)]
    pub module: u32,

    /// Insight from the module (repeatable)
    #[arg(short, long = "insight", required = true)]
    pub insights: Vec<String>,

    /// Overall assessment
    #[arg(short, long)]
    pub assessment: String,

    /// Key takeaway
    #[arg(short, long)]
    pub takeaway: String,
}

pub async fn set(args: ProgressArgs, config: &CoachConfig) -> Result<()> {
    let service = open_service(config);
    let response = service
        .set_progress(SetProgressRequest {
            session_id: args.session,
            module_number: args.module,
            percent: args.percent,
        })
        .await?;

    if response.progress != response.percent {
        eprintln!(
            "ℹ️  Reported {}%, progress stays at {}%",
            response.percent, response.progress
        );
    } else {
        eprintln!("✅ Progress {}%", response.progress);
    }
    print_json(&response)
}

pub async fn complete(args: CompleteArgs, config: &CoachConfig) -> Result<()> {
    let service = open_service(config);
    let response = service
        .complete_module(CompleteModuleRequest {
            session_id: args.session,
            module_number: args.module,
            summary: CompletionSummary {
                insights: args.insights,
                assessment: args.assessment,
                takeaway: args.takeaway,
            },
        })
        .await?;

    if response.already_complete {
        eprintln!("ℹ️  Module was already complete, returning stored summary");
    } else {
        eprintln!("🏁 Module complete");
    }
    print_json(&response)
}

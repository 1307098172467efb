//! Outcome commands - Present and select structured outcomes.

use anyhow::{Context, Result};
use clap::Args;

use coach_chat::{
    CoachConfig, OutcomeOption, PresentOutcomesRequest, SelectOutcomeRequest,
};

use super::{open_service, print_json};

#[derive(Args)]
pub struct PresentArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,

    /// Module number of the session
    #[arg(short, long)]
    pub module: u32,

    /// Option as `id=label` or `id=label=value` (repeatable)
    #[arg(short, long = "option", required = true)]
    pub options: Vec<String>,
}

#[derive(Args)]
pub struct SelectArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,

    /// Module number of the session
    #[arg(short, long)]
    pub module: u32,

    /// `eventSeq` of the outcomes event
    #[arg(short, long)]
    pub event_seq: u64,

    /// Option ID to select
    #[arg(short, long)]
    pub option: String,
}

pub async fn present(args: PresentArgs, config: &CoachConfig) -> Result<()> {
    let options = args
        .options
        .iter()
        .map(|raw| parse_option(raw))
        .collect::<Result<Vec<_>>>()?;

    let service = open_service(config);
    let response = service
        .present_outcomes(PresentOutcomesRequest {
            session_id: args.session,
            module_number: args.module,
            options,
        })
        .await?;

    eprintln!("✅ Outcomes presented as eventSeq {}", response.event_seq);
    print_json(&response)
}

pub async fn select(args: SelectArgs, config: &CoachConfig) -> Result<()> {
    let service = open_service(config);
    let response = service
        .select_outcome(SelectOutcomeRequest {
            session_id: args.session,
            module_number: args.module,
            event_seq: args.event_seq,
            option_id: args.option,
        })
        .await?;

    if response.replayed {
        eprintln!("ℹ️  Selection was already recorded");
    } else {
        eprintln!("✅ Selection recorded");
    }
    print_json(&response)
}

/// Parse `id=label[=value]`; the value defaults to the id
fn parse_option(raw: &str) -> Result<OutcomeOption> {
    let mut parts = raw.splitn(3, '=');
    let id = parts.next().unwrap_or_default().trim();
    let label = parts
        .next()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .with_context(|| format!("Invalid option argument '{}': expected id=label", raw))?;
    let value = parts.next().map(str::trim).unwrap_or(id);

    if id.is_empty() {
        anyhow::bail!("Invalid option argument '{}': empty id", raw);
    }
    Ok(OutcomeOption::new(id, label, value))
}

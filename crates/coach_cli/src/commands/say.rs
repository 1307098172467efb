//! Say command - Run one streamed assistant turn.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use tracing::info;

use coach_chat::{
    CoachConfig, ModelProducer, OpenAiProducer, ScriptedProducer, StartTurnRequest,
    StreamAccumulator, StreamEvent, TurnState,
};

use super::open_service_with;

#[derive(Args)]
pub struct SayArgs {
    /// Session ID
    #[arg(short, long)]
    pub session: String,

    /// Module number of the session
    #[arg(short, long)]
    pub module: u32,

    /// User message
    #[arg(long)]
    pub message: String,

    /// Replay model output from a JSON script instead of calling the LLM
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Print raw wire frames instead of the streamed text
    #[arg(long)]
    pub frames: bool,
}

pub async fn execute(args: SayArgs, config: &CoachConfig) -> Result<()> {
    let producer = load_producer(args.script.as_ref(), config)?;
    info!("Starting turn on session {} with {}", args.session, producer.name());

    let service = open_service_with(config, producer);
    let handle = service
        .start_turn(StartTurnRequest {
            session_id: args.session,
            module_number: args.module,
            message: args.message,
        })
        .await?;
    let (stream, task) = handle.into_parts();

    let mut events = stream.into_events().boxed();
    let mut acc = StreamAccumulator::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = events.next().await {
        if args.frames {
            write!(stdout, "{}", event.to_frame())?;
        } else {
            match &event {
                StreamEvent::TextDelta { content } => write!(stdout, "{}", content)?,
                StreamEvent::ToolExecuted {
                    tool_name,
                    refetch_events,
                } => eprintln!("\n🔧 {} (refetch: {})", tool_name, refetch_events),
                _ => {}
            }
        }
        stdout.flush()?;
        acc.apply(event);
    }
    if !args.frames {
        println!();
    }

    let report = task.await.context("Turn task did not finish")?;
    if report.state == TurnState::Error {
        anyhow::bail!(
            "Turn failed: {}",
            report.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    if report.module_complete {
        eprintln!("🏁 Module complete");
    }
    info!(
        "Turn done: {} chars, {} tools",
        acc.text().len(),
        report.tools_executed.len()
    );
    Ok(())
}

fn load_producer(script: Option<&PathBuf>, config: &CoachConfig) -> Result<Arc<dyn ModelProducer>> {
    if let Some(path) = script {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {:?}", path))?;
        return Ok(Arc::new(ScriptedProducer::from_json(&content)?));
    }

    let mut producer = OpenAiProducer::from_env()?;
    if let Some(model) = &config.model {
        producer = producer.with_model(model.clone());
    }
    Ok(Arc::new(producer))
}

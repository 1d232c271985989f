//! Mood analysis over a LeanPrompt session channel.
//!
//! Each line typed on stdin (or each positional message) becomes one turn on
//! the same session. The first turn sends the full prompt; later turns send
//! only the new message.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use futures::stream::{self, BoxStream, StreamExt};
use leanprompt::config::RuntimeConfig;
use leanprompt::kernel::{
    Orchestrator, OrchestratorConfig, OutboundMessage, RouteTable, SessionChannel,
    SessionRegistry, TaskScheduler,
};
use leanprompt::prompts::{DirectorySource, PromptStore, ResponseSchema};
use leanprompt::provider::build_gateway;
use leanprompt::telemetry::{TelemetryConfig, init_tracing};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Talk to a mood-analysis prompt through a cached session.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Runtime configuration file.
    #[arg(long, default_value = "demos/mood-session/leanprompt.toml")]
    config: PathBuf,
    /// Route the messages are addressed to.
    #[arg(long, default_value = "/mood/json")]
    path: String,
    /// Print chunks as they arrive. Invalid streamed responses cannot be
    /// corrected, so this turns off guardrail retries for the demo prompts.
    #[arg(long)]
    stream: bool,
    /// Messages to send in order; stdin lines are read when none are given.
    messages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = RuntimeConfig::load(&args.config)?;
    init_tracing(&TelemetryConfig::from(&config.telemetry))?;

    let gateway = build_gateway(&config.provider, config.transport.call_timeout())
        .context("failed to build provider gateway")?;

    let prompt_dir = relative_to(&args.config, &config.routes.prompt_dir);
    let prompts = PromptStore::with_source(Arc::new(DirectorySource::new(prompt_dir)));
    prompts
        .register_schema(
            "mood",
            ResponseSchema::parse([
                ("current_mood", "string"),
                ("confidence", "float[0,1]"),
                ("reason", "string"),
            ])?,
        )
        .await;

    let routes = Arc::new(RouteTable::from_config(&config.routes)?);
    for (path, prompt) in routes.iter() {
        info!(path, %prompt, "route");
    }

    let orchestrator = Orchestrator::new(
        Arc::new(SessionRegistry::new(config.session.idle_timeout())),
        Arc::new(prompts),
        gateway,
        OrchestratorConfig::from_runtime(&config),
    );
    let scheduler = TaskScheduler::default();
    let sweeper = orchestrator.start_sweeper(config.session.sweep_interval(), &scheduler)?;

    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let printer = tokio::spawn(print_messages(outbound_rx));
    let channel =
        SessionChannel::new(orchestrator, Arc::clone(&routes)).with_streaming(args.stream);
    let inbound = frames(args.path, args.messages);

    tokio::select! {
        () = channel.serve(inbound, outbound_tx) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!("interrupted; abandoning the current turn");
        }
    }

    let _ = printer.await;
    sweeper.stop().await;
    scheduler.close();
    Ok(())
}

fn relative_to(config: &Path, dir: &Path) -> PathBuf {
    if dir.is_absolute() {
        return dir.to_path_buf();
    }
    config
        .parent()
        .map_or_else(|| dir.to_path_buf(), |parent| parent.join(dir))
}

fn frame(path: &str, message: &str) -> Bytes {
    Bytes::from(json!({ "path": path, "message": message }).to_string())
}

fn frames(path: String, messages: Vec<String>) -> BoxStream<'static, Bytes> {
    if !messages.is_empty() {
        return stream::iter(messages.into_iter().map(move |message| frame(&path, &message)))
            .boxed();
    }

    let lines = BufReader::new(tokio::io::stdin()).lines();
    stream::unfold((lines, path), |(mut lines, path)| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => return Some((frame(&path, line.trim()), (lines, path))),
                Ok(None) => return None,
                Err(err) => {
                    warn!(%err, "failed to read stdin");
                    return None;
                }
            }
        }
    })
    .boxed()
}

async fn print_messages(mut outbound: mpsc::Receiver<OutboundMessage>) {
    while let Some(message) = outbound.recv().await {
        match message {
            OutboundMessage::SessionInit { session_id } => eprintln!("[session {session_id}]"),
            OutboundMessage::Chunk { text } => eprint!("{text}"),
            OutboundMessage::Complete { result } => {
                eprintln!();
                let pretty =
                    serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
                println!("{pretty}");
            }
            OutboundMessage::Error { message, details } => {
                eprintln!();
                eprintln!("error: {message}");
                if !details.is_null() {
                    eprintln!("{details:#}");
                }
            }
        }
    }
}

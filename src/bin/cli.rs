//! CLI binary for the companion.

use anyhow::Context;
use clap::{Parser, Subcommand};
use companion::audio::playback::list_output_devices;
use companion::health::{self, HealthSeverity};
use companion::history::store::JsonFileLogStore;
use companion::runtime::{RuntimeEvent, TurnStatus};
use companion::{
    CompanionConfig, ConversationLog, RejectReason, TurnOrchestrator, TurnOutcome, paths,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

/// Companion: type to the character, hear her answer.
#[derive(Parser)]
#[command(name = "companion", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured engine (`cloud` or `local`).
    #[arg(short, long)]
    engine: Option<String>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Chat with the character from the terminal.
    Chat,

    /// Inspect or manage the conversation log.
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },

    /// Check the selected backend and the speech server.
    Health,

    /// List available audio output devices.
    Devices,

    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum LogsAction {
    /// Print the log as JSON, or write it to PATH.
    Export { path: Option<PathBuf> },
    /// Delete every entry.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let command = cli.command.unwrap_or(Command::Chat);
    if let Command::InitConfig { force } = command {
        return init_config(cli.config.as_deref(), force);
    }

    let mut config = CompanionConfig::load(cli.config.as_deref())?;
    if let Some(engine) = cli.engine {
        config.ai.engine = engine;
    }

    match command {
        Command::Chat => run_chat(config).await,
        Command::Logs { action } => run_logs(&config, action),
        Command::Health => run_health(config).await,
        Command::Devices => list_devices(),
        Command::InitConfig { .. } => Ok(()),
    }
}

/// Stderr plus a daily rolling file under the diagnostics directory.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing() -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("companion=info,mistralrs_core=warn,candle_core=warn,hf_hub=warn")
    });
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("companion")
        .filename_suffix("log")
        .build(paths::diagnostics_dir());

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .init();
            tracing::warn!("file logging disabled: {e}");
            None
        }
    }
}

async fn run_chat(config: CompanionConfig) -> anyhow::Result<()> {
    println!("Companion v{}", env!("CARGO_PKG_VERSION"));

    let (tx, rx) = broadcast::channel(64);
    let orchestrator = TurnOrchestrator::from_config(&config)?.with_runtime_events(tx);
    let options = config.ai.clone();
    let speaker = config
        .sanitizer
        .role_names
        .last()
        .cloned()
        .unwrap_or_else(|| config.deployment_id.clone());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, shutting down...");
            cancel_clone.cancel();
        }
    });
    tokio::spawn(show_status(rx, cancel.clone()));

    if options.api_key.trim().is_empty()
        && companion::engine::EngineKind::from_name(&options.engine)
            == companion::engine::EngineKind::Cloud
    {
        println!("\nNo API key configured; set GEMINI_API_KEY or ai.api_key.");
    }
    println!("\nType a message and press Enter. /clear wipes the log, /quit exits.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "/quit" | "/exit" => break,
            "/clear" => {
                let log = orchestrator.log();
                match log.lock() {
                    Ok(mut log) => log.clear(),
                    Err(poisoned) => poisoned.into_inner().clear(),
                }
                println!("(log cleared)");
                continue;
            }
            _ => {}
        }

        let Some(outcome) = orchestrator
            .on_send_until_cancelled(&line, &options, &cancel)
            .await
        else {
            break;
        };
        match outcome {
            TurnOutcome::Replied { reply, .. } => println!("{speaker}: {reply}"),
            TurnOutcome::Failed { message } => eprintln!("turn failed: {message}"),
            TurnOutcome::Rejected(RejectReason::TooLong) => eprintln!(
                "message too long (limit {} characters)",
                config.timing.max_input_chars
            ),
            TurnOutcome::Rejected(RejectReason::Empty | RejectReason::Busy) => {}
        }
    }

    orchestrator.dispose().await;
    Ok(())
}

async fn show_status(mut rx: broadcast::Receiver<RuntimeEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = rx.recv() => event,
        };
        match event {
            Ok(RuntimeEvent::Status(status @ (TurnStatus::Thinking | TurnStatus::Speaking))) => {
                eprintln!("[{}]", status.label());
            }
            Ok(RuntimeEvent::VoiceUnavailable) => eprintln!("[voice unavailable]"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn run_logs(config: &CompanionConfig, action: LogsAction) -> anyhow::Result<()> {
    let store = JsonFileLogStore::new(config.chat_log.resolved_dir(), &config.deployment_id)?;
    let path = store.path();
    let mut log = ConversationLog::hydrate(config.chat_log.capacity, Arc::new(store));

    match action {
        LogsAction::Export { path: Some(out) } => {
            log.export_to(&out)
                .with_context(|| format!("exporting log to {}", out.display()))?;
            println!("Exported {} entries to {}", log.len(), out.display());
        }
        LogsAction::Export { path: None } => println!("{}", log.export()?),
        LogsAction::Clear => {
            log.clear();
            println!("Cleared {}", path.display());
        }
    }
    Ok(())
}

async fn run_health(config: CompanionConfig) -> anyhow::Result<()> {
    let orchestrator = TurnOrchestrator::from_config(&config)?;
    let report = health::run_checks(orchestrator.engines(), orchestrator.tts(), &config.ai).await;
    orchestrator.dispose().await;

    for finding in &report.findings {
        let mark = match finding.severity {
            HealthSeverity::Ok => "ok",
            HealthSeverity::Warning => "warn",
            HealthSeverity::Error => "FAIL",
        };
        println!("[{mark}] {}: {}", finding.id, finding.summary);
        for line in &finding.evidence {
            println!("       {line}");
        }
    }

    if report.is_healthy() {
        Ok(())
    } else {
        anyhow::bail!("health check failed")
    }
}

fn list_devices() -> anyhow::Result<()> {
    println!("Output devices:");
    for name in list_output_devices()? {
        println!("  - {name}");
    }
    Ok(())
}

fn init_config(path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(CompanionConfig::default_config_path);
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    CompanionConfig::default().save_to_file(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

#![forbid(unsafe_code)]

//! `deepdive-supervisor` — supervises a codebase-exploration agent.
//!
//! Bootstraps configuration and tracing, connects the session store,
//! wires the supervisor over the process-backed worker adapter, and runs
//! one session to completion, streaming events to stdout as JSON lines.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use deepdive_supervisor::bus::SessionEvent;
use deepdive_supervisor::config::GlobalConfig;
use deepdive_supervisor::persistence::{db, resume_repo::ResumeRepo};
use deepdive_supervisor::repair::validator::CommandValidator;
use deepdive_supervisor::repair::{spawn_driver, DiagramRepairLoop};
use deepdive_supervisor::supervisor::session::SessionSupervisor;
use deepdive_supervisor::worker::process::ProcessWorkerFactory;
use deepdive_supervisor::worker::WorkerParams;
use deepdive_supervisor::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "deepdive-supervisor", about = "Agent session supervisor", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: SessionCommand,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    /// Start a new supervised session.
    Start {
        /// Initial task prompt for the worker.
        prompt: String,
        /// Optional path scope restricting the exploration.
        #[arg(long)]
        scope: Option<String>,
        /// Optional model override.
        #[arg(long)]
        model: Option<String>,
    },
    /// Resume a previously persisted session.
    Resume {
        /// Identifier of the session to resume.
        session_id: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format);
    info!("deepdive-supervisor bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => fmt().with_env_filter(filter).with_writer(std::io::stderr).init(),
        LogFormat::Json => fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    let config = Arc::new(config);
    info!("configuration loaded");

    // ── Initialize session store ────────────────────────
    let pool = db::connect(&config.store.path).await?;
    let store = ResumeRepo::new(pool);
    info!("session store connected");

    // ── Wire the supervisor ─────────────────────────────
    let factory = Arc::new(ProcessWorkerFactory::new(&config.worker)?);
    let supervisor = SessionSupervisor::new(Arc::clone(&config), factory, store);

    // Stream every event to stdout as a JSON line and watch for the
    // terminal ones.
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let _stream = supervisor.subscribe(Box::new(move |event| {
        println!("{}", serde_json::to_string(event)?);
        if matches!(event, SessionEvent::Stopped | SessionEvent::Failed { .. }) {
            let _ = done_tx.send(());
        }
        Ok(())
    }));

    // Diagram repair runs only when a renderer is configured.
    let repair_cancel = CancellationToken::new();
    let _repair = match &config.repair.validator_cmd {
        Some(command_line) => {
            let validator = Arc::new(CommandValidator::new(command_line)?);
            let repair = Arc::new(DiagramRepairLoop::new(
                Arc::clone(&supervisor),
                validator,
                &config.repair,
            ));
            Some(spawn_driver(
                repair,
                supervisor.bus(),
                repair_cancel.clone(),
            ))
        }
        None => {
            info!("no repair.validator_cmd configured; diagram repair disabled");
            None
        }
    };

    // ── Run the session ─────────────────────────────────
    let session_id = match args.command {
        SessionCommand::Start {
            prompt,
            scope,
            model,
        } => {
            supervisor
                .start(WorkerParams {
                    prompt,
                    scope,
                    model,
                    history: Vec::new(),
                })
                .await?
        }
        SessionCommand::Resume { session_id } => supervisor.resume(&session_id).await?,
    };
    info!(%session_id, "session supervised; streaming events");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, stopping session");
            supervisor.stop().await?;
        }
        _ = done_rx.recv() => {}
    }

    repair_cancel.cancel();
    info!(%session_id, "session ended");
    Ok(())
}

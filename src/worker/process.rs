//! Process-backed worker adapter.
//!
//! Spawns the configured agent CLI as a child process with
//! `kill_on_drop(true)`. The wire contract with the CLI is JSON lines in
//! both directions: the adapter writes prompt/abort commands to the
//! child's stdin and decodes [`WorkerEvent`]s from its stdout. A child
//! exit of any kind is reported as a crash event — a worker that ends on
//! its own ended unexpectedly from the supervisor's point of view.

use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::config::WorkerConfig;
use crate::{AppError, Result};

use super::{WorkerEvent, WorkerFactory, WorkerHandle, WorkerParams, WorkerStats};

/// Commands written to the child's stdin, one JSON object per line.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WorkerCommand<'a> {
    Prompt { text: &'a str },
    Abort,
    History { messages: &'a [serde_json::Value] },
}

struct Shared {
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
    stats: StdMutex<WorkerStats>,
}

impl Shared {
    fn broadcast(&self, event: &WorkerEvent) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn fold_stats(&self, event: &WorkerEvent) {
        let Ok(mut stats) = self.stats.lock() else {
            return;
        };
        match event {
            WorkerEvent::Message { .. } => stats.messages += 1,
            WorkerEvent::Usage {
                input_tokens,
                output_tokens,
                cost_usd,
            } => {
                stats.input_tokens += *input_tokens;
                stats.output_tokens += *output_tokens;
                stats.cost_usd += *cost_usd;
            }
            WorkerEvent::DocumentComplete { .. } | WorkerEvent::Crashed { .. } => {}
        }
    }
}

/// One live agent CLI process.
pub struct ProcessWorker {
    shared: Arc<Shared>,
    stdin: Mutex<ChildStdin>,
}

impl ProcessWorker {
    async fn write_command(&self, command: &WorkerCommand<'_>) -> Result<()> {
        let mut line = serde_json::to_string(command)
            .map_err(|err| AppError::Prompt(format!("command not serializable: {err}")))?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Prompt(format!("worker rejected input: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| AppError::Prompt(format!("worker rejected input: {err}")))
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.shared.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    async fn prompt(&self, text: &str) -> Result<()> {
        self.write_command(&WorkerCommand::Prompt { text }).await
    }

    async fn abort(&self) {
        // Idempotent: the CLI ignores aborts with nothing in flight.
        if let Err(err) = self.write_command(&WorkerCommand::Abort).await {
            debug!(%err, "abort not delivered; worker already gone");
        }
    }

    async fn stats(&self) -> Result<WorkerStats> {
        self.shared
            .stats
            .lock()
            .map(|stats| *stats)
            .map_err(|_| AppError::Prompt("worker stats unavailable".into()))
    }
}

/// Decode child stdout lines into events until the process exits, then
/// report the exit as a crash. Owns the child so `kill_on_drop` fires if
/// the task is ever torn down.
async fn pump_events(mut child: Child, stdout: ChildStdout, shared: Arc<Shared>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerEvent>(line) {
                    Ok(event) => {
                        shared.fold_stats(&event);
                        shared.broadcast(&event);
                        if matches!(event, WorkerEvent::Crashed { .. }) {
                            return;
                        }
                    }
                    Err(err) => debug!(%err, line, "skipping undecodable worker output"),
                }
            }
            Ok(None) | Err(_) => break,
        }
    }

    // Stream ended: the process is gone or going. Map its exit status the
    // way an operator would want to read it.
    let status_text = match child.wait().await {
        Ok(status) if status.success() => "exited normally (code 0)".to_owned(),
        Ok(status) => status.code().map_or_else(
            || "terminated by signal".to_owned(),
            |code| format!("exited with code {code}"),
        ),
        Err(err) => format!("exit status unknown: {err}"),
    };
    info!(status = %status_text, "worker process ended");
    shared.broadcast(&WorkerEvent::Crashed {
        error: format!("worker process {status_text}"),
    });
}

/// Factory that launches one agent CLI process per worker instance.
pub struct ProcessWorkerFactory {
    cli: String,
    args: Vec<String>,
}

impl ProcessWorkerFactory {
    /// Build from worker configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no CLI binary is configured.
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        if config.cli.is_empty() {
            return Err(AppError::Config("worker.cli is not configured".into()));
        }
        Ok(Self {
            cli: config.cli.clone(),
            args: config.args.clone(),
        })
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn create(&self, params: &WorkerParams) -> Result<Arc<dyn WorkerHandle>> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(&self.args)
            .arg(&params.prompt)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(scope) = &params.scope {
            cmd.env("DEEPDIVE_SCOPE", scope);
        }
        if let Some(model) = &params.model {
            cmd.env("DEEPDIVE_MODEL", model);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::WorkerCreation(format!("failed to spawn worker cli: {err}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::WorkerCreation("worker stdout not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::WorkerCreation("worker stdin not captured".into()))?;

        info!(cli = %self.cli, pid = child.id().unwrap_or(0), "worker process spawned");

        let shared = Arc::new(Shared {
            subscribers: StdMutex::new(Vec::new()),
            stats: StdMutex::new(WorkerStats::default()),
        });
        tokio::spawn(pump_events(child, stdout, Arc::clone(&shared)));

        let worker = ProcessWorker {
            shared,
            stdin: Mutex::new(stdin),
        };

        // A resumed worker is rebound to its prior conversation before
        // anything else is written.
        if !params.history.is_empty() {
            worker
                .write_command(&WorkerCommand::History {
                    messages: &params.history,
                })
                .await
                .map_err(|err| AppError::WorkerCreation(err.to_string()))?;
        }

        Ok(Arc::new(worker))
    }
}

//! Bounded diagram repair protocol.
//!
//! When the worker completes a document, its fenced mermaid blocks are
//! validated through an external renderer. Invalid blocks are fed back to
//! the worker as one consolidated corrective prompt per cycle, naming each
//! failing block and its renderer error, until every block validates or
//! every remaining invalid block has exhausted the cycle limit. Blocks
//! still invalid at termination are surfaced on the bus, never dropped.

pub mod validator;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, SessionEvent, Subscription};
use crate::config::RepairConfig;
use crate::models::diagram::{DiagramBlock, ValidationState};
use crate::supervisor::session::SessionSupervisor;
use crate::worker::WorkerEvent;
use crate::{AppError, Result};

/// External renderer collaborator used to validate diagram source.
#[async_trait]
pub trait DiagramValidator: Send + Sync {
    /// Check one diagram source.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` with the renderer's diagnostic when
    /// the source does not render.
    async fn validate(&self, source: &str) -> Result<()>;
}

fn fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)] // the pattern is a static literal
    RE.get_or_init(|| {
        Regex::new(r"(?ms)^```mermaid[ \t]*\r?\n(.*?)^```[ \t]*\r?$")
            .expect("static fence pattern")
    })
}

/// Extract ordered fenced mermaid blocks from a markdown document.
#[must_use]
pub fn extract_diagram_blocks(markdown: &str) -> Vec<DiagramBlock> {
    fence_pattern()
        .captures_iter(markdown)
        .enumerate()
        .map(|(index, captures)| {
            let source = captures
                .get(1)
                .map(|body| body.as_str().trim_end().to_owned())
                .unwrap_or_default();
            DiagramBlock::new(index, source)
        })
        .collect()
}

/// Outcome of one repair pass over a document.
#[derive(Debug, Clone)]
pub struct RepairReport {
    /// Final state of every extracted block.
    pub blocks: Vec<DiagramBlock>,
    /// Correction cycles executed.
    pub cycles: u32,
    /// The document text as of the last worker output.
    pub document: String,
}

impl RepairReport {
    /// Whether every block ended `Valid`.
    #[must_use]
    pub fn all_valid(&self) -> bool {
        self.blocks
            .iter()
            .all(|block| block.validation == ValidationState::Valid)
    }

    /// Blocks still invalid at termination.
    #[must_use]
    pub fn unresolved(&self) -> Vec<&DiagramBlock> {
        self.blocks
            .iter()
            .filter(|block| block.validation == ValidationState::Invalid)
            .collect()
    }
}

/// Bounded validate-and-correct loop over one document at a time.
pub struct DiagramRepairLoop {
    supervisor: Arc<SessionSupervisor>,
    validator: Arc<dyn DiagramValidator>,
    cycle_limit: u32,
    response_timeout: Duration,
    /// Cycles reuse the single active worker; passes never overlap.
    pass_guard: Mutex<()>,
}

impl DiagramRepairLoop {
    /// Construct a repair loop bound to a supervisor and validator.
    #[must_use]
    pub fn new(
        supervisor: Arc<SessionSupervisor>,
        validator: Arc<dyn DiagramValidator>,
        config: &RepairConfig,
    ) -> Self {
        Self {
            supervisor,
            validator,
            cycle_limit: config.cycle_limit,
            response_timeout: Duration::from_secs(config.response_timeout_seconds),
            pass_guard: Mutex::new(()),
        }
    }

    /// Run one repair pass over a completed document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionEnded`/`AppError::Prompt` if a corrective
    /// prompt cannot be submitted, or `AppError::Unresponsive` if the
    /// worker does not produce a corrected document in time.
    pub async fn run(&self, document: &str) -> Result<RepairReport> {
        let _pass = self.pass_guard.lock().await;

        let mut document = document.to_owned();
        let mut blocks = extract_diagram_blocks(&document);
        if blocks.is_empty() {
            debug!("document contains no diagram blocks");
            return Ok(RepairReport {
                blocks,
                cycles: 0,
                document,
            });
        }

        for block in &mut blocks {
            self.validate_block(block).await;
        }

        let mut cycles: u32 = 0;
        loop {
            let pending: Vec<usize> = blocks
                .iter()
                .filter(|block| {
                    block.validation == ValidationState::Invalid
                        && block.fix_attempts < self.cycle_limit
                })
                .map(|block| block.index)
                .collect();
            if pending.is_empty() {
                break;
            }
            cycles += 1;
            info!(cycle = cycles, blocks = pending.len(), "requesting diagram corrections");

            let prompt = corrective_prompt(&blocks, &pending);
            document = self.request_correction(&prompt).await?;

            let fresh = extract_diagram_blocks(&document);
            // Positional identity only holds while the correction keeps
            // every block in place: a dropped or reordered block shifts
            // later indexes onto some other diagram's source, so a changed
            // count means the pending blocks cannot be trusted as fixed.
            let layout_kept = fresh.len() == blocks.len();
            for index in pending {
                let Some(block) = blocks.get_mut(index) else {
                    continue;
                };
                block.fix_attempts += 1;
                if layout_kept {
                    if let Some(replacement) =
                        fresh.iter().find(|candidate| candidate.index == index)
                    {
                        block.source = replacement.source.clone();
                        self.validate_block(block).await;
                        continue;
                    }
                }
                block.validation = ValidationState::Invalid;
                block.last_error = Some("block missing from the corrected document".into());
            }
        }

        let unresolved: Vec<DiagramBlock> = blocks
            .iter()
            .filter(|block| block.validation == ValidationState::Invalid)
            .cloned()
            .collect();
        if !unresolved.is_empty() {
            warn!(
                count = unresolved.len(),
                "diagram blocks remain invalid after repair"
            );
            self.supervisor
                .bus()
                .publish(&SessionEvent::DiagramsUnresolved { blocks: unresolved });
        }

        Ok(RepairReport {
            blocks,
            cycles,
            document,
        })
    }

    async fn validate_block(&self, block: &mut DiagramBlock) {
        match self.validator.validate(&block.source).await {
            Ok(()) => {
                block.validation = ValidationState::Valid;
                block.last_error = None;
            }
            Err(err) => {
                block.validation = ValidationState::Invalid;
                block.last_error = Some(err.to_string());
            }
        }
    }

    /// Submit a corrective prompt and wait for the next completed
    /// document. The bus subscription is registered before prompting so
    /// the corrected document cannot slip past.
    async fn request_correction(&self, prompt: &str) -> Result<String> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.supervisor.bus().subscribe(Box::new(move |event| {
            if let SessionEvent::Worker(WorkerEvent::DocumentComplete { markdown }) = event {
                let _ = tx.send(markdown.clone());
            }
            Ok(())
        }));

        self.supervisor.prompt(prompt).await?;

        let outcome = tokio::time::timeout(self.response_timeout, rx.recv()).await;
        subscription.unsubscribe();
        match outcome {
            Ok(Some(markdown)) => Ok(markdown),
            Ok(None) => Err(AppError::Unresponsive(
                "document channel closed before a corrected document arrived".into(),
            )),
            Err(_) => Err(AppError::Unresponsive(format!(
                "worker did not produce a corrected document within {}s",
                self.response_timeout.as_secs()
            ))),
        }
    }
}

fn corrective_prompt(blocks: &[DiagramBlock], pending: &[usize]) -> String {
    let mut text = String::from(
        "Some mermaid diagrams in the generated document failed to render. \
         Regenerate the complete document, correcting only the diagrams \
         listed below and leaving all other content unchanged:\n",
    );
    for index in pending {
        if let Some(block) = blocks.get(*index) {
            let error = block
                .last_error
                .as_deref()
                .unwrap_or("unknown renderer error");
            text.push_str(&format!("- diagram {}: {error}\n", index + 1));
        }
    }
    text
}

/// Watch the bus for completed documents and run a repair pass for each.
///
/// Documents that arrive while a pass is running are that pass's own
/// corrected drafts; they are consumed by the pass and drained here.
#[must_use]
pub fn spawn_driver(
    repair: Arc<DiagramRepairLoop>,
    bus: &EventBus,
    cancel: CancellationToken,
) -> (Subscription, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = bus.subscribe(Box::new(move |event| {
        if let SessionEvent::Worker(WorkerEvent::DocumentComplete { markdown }) = event {
            let _ = tx.send(markdown.clone());
        }
        Ok(())
    }));

    let handle = tokio::spawn(async move {
        loop {
            let document = tokio::select! {
                () = cancel.cancelled() => return,
                document = rx.recv() => document,
            };
            let Some(document) = document else { return };

            if let Err(err) = repair.run(&document).await {
                warn!(%err, "diagram repair pass failed");
            }
            // Drop drafts the pass itself already consumed.
            while rx.try_recv().is_ok() {}
        }
    });

    (subscription, handle)
}

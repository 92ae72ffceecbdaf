//! Worker contract consumed by the supervisor.
//!
//! The worker — the external agent that actually explores a codebase and
//! responds to prompts — is an opaque collaborator. The supervisor only
//! sees the narrow capability set below: create, subscribe, prompt, abort,
//! stats. Any compliant implementation can be substituted; tests use a
//! scripted fake, the binary uses the process-backed adapter.

pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// Events emitted by a worker instance over its subscription channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A conversational message produced by the worker.
    Message {
        /// Message role (`assistant`, `tool`, ...).
        role: String,
        /// Message text.
        text: String,
    },
    /// Token and cost usage reported by the worker.
    Usage {
        /// Input tokens consumed since the last usage report.
        input_tokens: u64,
        /// Output tokens produced since the last usage report.
        output_tokens: u64,
        /// Cost in USD since the last usage report.
        cost_usd: f64,
    },
    /// The worker finished a candidate document artifact.
    DocumentComplete {
        /// Full markdown of the produced document.
        markdown: String,
    },
    /// The worker terminated unexpectedly. Consumed by the supervisor's
    /// recovery path, never forwarded as a passthrough event.
    Crashed {
        /// Summary of the termination cause.
        error: String,
    },
}

/// Usage counters reported by [`WorkerHandle::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerStats {
    /// Messages exchanged with the model.
    pub messages: u64,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Accumulated cost in USD.
    pub cost_usd: f64,
}

/// Creation parameters handed to the worker factory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerParams {
    /// Initial task prompt.
    pub prompt: String,
    /// Optional path scope restricting the exploration.
    pub scope: Option<String>,
    /// Optional model override.
    pub model: Option<String>,
    /// Prior conversation history to bind a resumed worker to.
    #[serde(default)]
    pub history: Vec<serde_json::Value>,
}

/// Handle to one live worker instance.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    /// Register a new event receiver. Every subscriber sees every event
    /// emitted after the call, in emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent>;

    /// Submit a prompt. Suspends until the worker accepts it; the worker
    /// never queues silently.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Prompt` if the worker rejects the prompt.
    async fn prompt(&self, text: &str) -> Result<()>;

    /// Cancel the in-flight prompt, if any. Idempotent; a no-op when
    /// nothing is in flight.
    async fn abort(&self);

    /// Current usage counters. Doubles as the liveness probe: a stalled
    /// worker fails to answer within the prober's timeout.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Prompt` if the worker cannot report stats.
    async fn stats(&self) -> Result<WorkerStats>;
}

/// Factory that creates worker instances, injected into the supervisor.
/// The same factory serves initial creation and crash replacement.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Create a new worker bound to the given parameters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::WorkerCreation` if no worker could be created.
    async fn create(&self, params: &WorkerParams) -> Result<Arc<dyn WorkerHandle>>;
}

//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state for a supervised session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Worker is being created; no events flow yet.
    Starting,
    /// Worker is live and accepting prompts.
    Running,
    /// Worker missed liveness probes but has not crashed.
    Unresponsive,
    /// Worker crashed; restart policy is being consulted.
    Restarting,
    /// Session ended by explicit stop. Terminal.
    Stopped,
    /// Session ended after restart attempts were exhausted. Terminal.
    Failed,
}

impl SessionState {
    /// Whether this state admits no further worker activity.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether prompts may be forwarded to the worker in this state.
    #[must_use]
    pub fn accepts_prompts(self) -> bool {
        matches!(self, Self::Running | Self::Unresponsive)
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Running | Self::Restarting | Self::Stopped)
                | (Self::Running, Self::Unresponsive | Self::Restarting | Self::Stopped)
                | (Self::Unresponsive, Self::Running | Self::Restarting | Self::Stopped)
                | (Self::Restarting, Self::Starting | Self::Failed | Self::Stopped)
        )
    }
}

/// Cumulative usage counters, owned exclusively by the supervisor and
/// updated only from worker events.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct SessionStats {
    /// Worker messages observed.
    pub messages: u64,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Accumulated cost in USD.
    pub cost_usd: f64,
}

/// Ephemeral record of one crash, consulted by the restart policy and
/// carried in the `restarted` event payload. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartAttempt {
    /// 1-based attempt ordinal.
    pub attempt: u32,
    /// Captured summary of the error that killed the previous worker.
    pub error: String,
    /// When the crash was observed.
    pub at: DateTime<Utc>,
}

/// The unit of supervision: one worker lifetime, possibly spanning
/// multiple worker instances due to restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Stable identifier, generated once, never reused.
    pub id: String,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Identifier of the persisted record this session was resumed from.
    pub resumed_from: Option<String>,
    /// Restart attempts consumed within this session lifetime.
    pub restart_count: u32,
    /// Cumulative usage counters.
    pub stats: SessionStats,
}

impl Session {
    /// Construct a fresh session with a generated identifier.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Starting,
            created_at: Utc::now(),
            resumed_from: None,
            restart_count: 0,
            stats: SessionStats::default(),
        }
    }

    /// Construct a session resumed from a persisted record.
    #[must_use]
    pub fn resumed(record_id: &str, created_at: DateTime<Utc>, stats: SessionStats) -> Self {
        Self {
            id: record_id.to_owned(),
            state: SessionState::Starting,
            created_at,
            resumed_from: Some(record_id.to_owned()),
            restart_count: 0,
            stats,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

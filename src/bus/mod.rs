//! In-process publish/subscribe primitive.
//!
//! Synchronous fan-out with explicit ordering semantics: `publish` invokes
//! the listeners registered at publish start, in subscription order, on the
//! publishing flow of control. Listeners registered mid-publish do not see
//! the in-flight event; listeners unsubscribed mid-publish see nothing
//! further, including the remainder of that publish. A failing listener is
//! reported and skipped, never aborting the fan-out. The bus knows nothing
//! about sessions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::models::diagram::DiagramBlock;
use crate::worker::WorkerEvent;
use crate::Result;

/// Events published by the supervisor to its subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session began (fresh or resumed).
    Started {
        /// Session identifier.
        session_id: String,
    },
    /// Opaque passthrough of a worker event, in emission order.
    Worker(WorkerEvent),
    /// Liveness probes missed past the threshold; worker may be stalled.
    Unresponsive,
    /// Liveness probe succeeded after an unresponsive period.
    Recovered,
    /// A crashed worker is about to be replaced.
    Restarted {
        /// 1-based restart attempt ordinal.
        attempt: u32,
        /// Error that killed the previous worker.
        previous_error: String,
    },
    /// Session ended by explicit stop.
    Stopped,
    /// Session ended after restart attempts were exhausted.
    Failed {
        /// Human-readable summary including total attempts made.
        error: String,
    },
    /// Prior conversation history of a resumed session. Emitted at most
    /// once per session lifetime.
    HistoryReplay {
        /// Persisted history entries in append order.
        messages: Vec<serde_json::Value>,
    },
    /// Diagram blocks still invalid after the repair loop exhausted its
    /// cycle limit.
    DiagramsUnresolved {
        /// Final state of the unresolved blocks.
        blocks: Vec<DiagramBlock>,
    },
}

/// Listener callback invoked on the publishing task.
pub type Listener = Box<dyn Fn(&SessionEvent) -> Result<()> + Send + Sync>;

struct BusInner {
    listeners: Mutex<Vec<(u64, Arc<Listener>)>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn remove(&self, id: u64) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.listeners
            .lock()
            .is_ok_and(|listeners| listeners.iter().any(|(entry_id, _)| *entry_id == id))
    }
}

/// Opaque subscription handle. The only operation is unsubscribing, which
/// is idempotent and safe to call from within a listener callback. The
/// subscription is also removed when the handle is dropped.
pub struct Subscription {
    inner: Arc<BusInner>,
    id: u64,
    done: AtomicBool,
}

impl Subscription {
    /// Remove the listener. Takes effect no later than the next dispatch
    /// to this listener; events already delivered are unaffected.
    pub fn unsubscribe(&self) {
        if !self.done.swap(true, Ordering::SeqCst) {
            self.inner.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// Synchronous fan-out event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a listener. The listener sees only events published after
    /// this call returns; nothing is buffered or replayed.
    #[must_use]
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.inner.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            inner: Arc::clone(&self.inner),
            id,
            done: AtomicBool::new(false),
        }
    }

    /// Deliver an event to every listener registered at call time, in
    /// subscription order. Listener failures are logged and skipped.
    pub fn publish(&self, event: &SessionEvent) {
        // Snapshot under the lock, then release it before any callback so
        // listeners can unsubscribe (themselves or others) without deadlock.
        let snapshot: Vec<(u64, Arc<Listener>)> = match self.inner.listeners.lock() {
            Ok(listeners) => listeners.clone(),
            Err(_) => return,
        };

        for (id, listener) in snapshot {
            // An unsubscribe that landed mid-publish suppresses the rest of
            // this publish for that listener.
            if !self.inner.contains(id) {
                continue;
            }
            if let Err(err) = listener(event) {
                warn!(%err, subscriber = id, "event listener failed; continuing fan-out");
            }
        }
    }

    /// Number of currently registered listeners.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .map_or(0, |listeners| listeners.len())
    }
}

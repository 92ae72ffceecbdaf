//! Per-session liveness prober, independent of crash detection.
//!
//! Crash detection relies on the worker signaling its own death; the
//! health monitor instead actively probes the worker on a fixed interval
//! and reports, over a `tokio::sync::mpsc` channel, when consecutive probe
//! timeouts cross a threshold. An unresponsive worker is stalled, not
//! dead — the supervisor surfaces the signal to subscribers and never
//! restarts on it alone.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use crate::worker::WorkerHandle;

/// Events emitted by the health monitor for supervisor handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Consecutive probe timeouts crossed the miss threshold.
    Unresponsive {
        /// Misses accumulated when the event was generated.
        missed: u32,
    },
    /// A probe succeeded after an unresponsive period.
    Recovered,
}

/// Probe bookkeeping, private to the monitor task and discarded with it.
#[derive(Debug, Clone, Copy)]
struct HeartbeatRecord {
    last_probe_at: Instant,
    last_response_at: Option<Instant>,
}

/// Builder for a per-session health monitor.
///
/// Call [`spawn`](Self::spawn) to start the background prober task.
pub struct HealthMonitor {
    session_id: String,
    worker: Arc<dyn WorkerHandle>,
    probe_interval: Duration,
    probe_timeout: Duration,
    miss_threshold: u32,
    event_tx: mpsc::Sender<HealthEvent>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    /// Construct a new monitor (does not start probing yet).
    #[must_use]
    pub fn new(
        session_id: String,
        worker: Arc<dyn WorkerHandle>,
        probe_interval: Duration,
        probe_timeout: Duration,
        miss_threshold: u32,
        event_tx: mpsc::Sender<HealthEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            worker,
            probe_interval,
            probe_timeout,
            miss_threshold,
            event_tx,
            cancel,
        }
    }

    /// Spawn the background prober task and return a handle for it.
    #[must_use]
    pub fn spawn(self) -> HealthMonitorHandle {
        let cancel_for_handle = self.cancel.clone();
        let session_id = self.session_id.clone();

        let task_handle = tokio::spawn(self.run().instrument(info_span!("health_monitor")));

        HealthMonitorHandle {
            session_id,
            join_handle: Some(task_handle),
            cancel: cancel_for_handle,
        }
    }

    /// Core probe loop.
    async fn run(self) {
        let mut misses: u32 = 0;
        let mut unresponsive = false;
        let mut record = HeartbeatRecord {
            last_probe_at: Instant::now(),
            last_response_at: None,
        };

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!(session_id = %self.session_id, "health monitor cancelled");
                    return;
                }
                () = tokio::time::sleep(self.probe_interval) => {}
            }

            record.last_probe_at = Instant::now();
            let probe = tokio::time::timeout(self.probe_timeout, self.worker.stats());

            let responded = tokio::select! {
                () = self.cancel.cancelled() => return,
                outcome = probe => matches!(outcome, Ok(Ok(_))),
            };

            if responded {
                record.last_response_at = Some(Instant::now());
                misses = 0;
                if unresponsive {
                    unresponsive = false;
                    info!(session_id = %self.session_id, "worker recovered");
                    let _ = self.event_tx.send(HealthEvent::Recovered).await;
                }
                continue;
            }

            misses += 1;
            debug!(session_id = %self.session_id, misses, "probe missed");

            if misses >= self.miss_threshold && !unresponsive {
                unresponsive = true;
                info!(
                    session_id = %self.session_id,
                    misses, "worker declared unresponsive"
                );
                let _ = self
                    .event_tx
                    .send(HealthEvent::Unresponsive { missed: misses })
                    .await;
            }
        }
    }
}

/// Handle returned from [`HealthMonitor::spawn`].
pub struct HealthMonitorHandle {
    session_id: String,
    /// Task handle for the background prober loop.
    join_handle: Option<JoinHandle<()>>,
    /// Cancelled when the handle is dropped, halting probing immediately.
    cancel: CancellationToken,
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl HealthMonitorHandle {
    /// The session ID this monitor probes.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Stop probing and wait for the task to exit.
    pub async fn await_completion(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

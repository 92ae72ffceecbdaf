//! The session supervisor — central state machine.
//!
//! Owns exactly one active session and its current worker instance,
//! consults the restart policy on crashes, drives the health monitor,
//! publishes through the event bus, and persists to the resume store on
//! every worker event. All session mutation goes through one
//! `tokio::sync::Mutex`-guarded inner; worker events are pumped by a
//! forwarder task per worker instance so publishing never blocks the
//! worker itself.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{EventBus, Listener, SessionEvent, Subscription};
use crate::config::GlobalConfig;
use crate::models::session::{RestartAttempt, Session, SessionState, SessionStats};
use crate::persistence::resume_repo::{ResumeRepo, SessionRecord};
use crate::worker::{WorkerEvent, WorkerFactory, WorkerHandle, WorkerParams};
use crate::{AppError, Result};

use super::health_monitor::{HealthEvent, HealthMonitor, HealthMonitorHandle};
use super::restart_policy::{RestartDecision, RestartPolicy};

/// Capacity of the health event channel; probes are slow relative to
/// consumption, so a small buffer suffices.
const HEALTH_CHANNEL_CAPACITY: usize = 8;

struct Inner {
    session: Option<Session>,
    params: Option<WorkerParams>,
    worker: Option<Arc<dyn WorkerHandle>>,
    monitor: Option<HealthMonitorHandle>,
    /// Cancels the forwarder, monitor, and health consumer of the current
    /// worker instance.
    cancel: CancellationToken,
    /// Bumped whenever the worker is replaced or the session ends, so
    /// stale tasks from a previous worker cannot mutate current state.
    epoch: u64,
    /// One-shot gate for the resumed-session history replay.
    history_replayed: bool,
}

/// Supervises one session at a time: lifecycle, recovery, event fan-out.
pub struct SessionSupervisor {
    config: Arc<GlobalConfig>,
    policy: RestartPolicy,
    factory: Arc<dyn WorkerFactory>,
    bus: EventBus,
    store: ResumeRepo,
    inner: Mutex<Inner>,
}

impl SessionSupervisor {
    /// Construct a supervisor with an injected worker factory.
    #[must_use]
    pub fn new(
        config: Arc<GlobalConfig>,
        factory: Arc<dyn WorkerFactory>,
        store: ResumeRepo,
    ) -> Arc<Self> {
        let policy = RestartPolicy::new(&config.restart);
        Arc::new(Self {
            config,
            policy,
            factory,
            bus: EventBus::new(),
            store,
            inner: Mutex::new(Inner {
                session: None,
                params: None,
                worker: None,
                monitor: None,
                cancel: CancellationToken::new(),
                epoch: 0,
                history_replayed: false,
            }),
        })
    }

    /// The event bus this supervisor publishes through.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Register a listener for session events. No past events are
    /// replayed; the listener sees events from this moment onward.
    #[must_use]
    pub fn subscribe(&self, listener: Listener) -> Subscription {
        self.bus.subscribe(listener)
    }

    /// Start a brand-new session.
    ///
    /// Constructs a fresh session id, persists the record, invokes the
    /// worker factory, and transitions to `Running` on success. Returns
    /// the new session id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if a session is already active, or
    /// `AppError::WorkerCreation` if the factory fails before any worker
    /// exists (the session is marked `Failed`; no restart attempt is
    /// consumed).
    pub async fn start(self: &Arc<Self>, params: WorkerParams) -> Result<String> {
        let mut inner = self.inner.lock().await;
        Self::ensure_no_active_session(&inner)?;

        let session = Session::new();
        let session_id = session.id.clone();
        let record = SessionRecord::new(&session_id, &params);
        self.store.create(&record).await?;

        inner.session = Some(session);
        inner.params = Some(params.clone());
        inner.history_replayed = false;

        info!(%session_id, "session starting");
        self.bus.publish(&SessionEvent::Started {
            session_id: session_id.clone(),
        });

        self.create_initial_worker(&mut inner, &params).await?;
        Ok(session_id)
    }

    /// Resume a previously persisted session.
    ///
    /// Loads the record and its history, re-creates a worker bound to
    /// that history, and replays the history to subscribers exactly once.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no record exists for the id,
    /// `AppError::Config` if a session is already active, or
    /// `AppError::WorkerCreation` if the factory fails.
    pub async fn resume(self: &Arc<Self>, session_id: &str) -> Result<String> {
        let mut inner = self.inner.lock().await;
        Self::ensure_no_active_session(&inner)?;

        let record = self
            .store
            .get_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no session record for id {session_id}")))?;
        let history = self.store.load_history(session_id).await?;
        self.store.mark_resumed(session_id).await?;

        let params = WorkerParams {
            prompt: record.prompt.clone(),
            scope: record.scope.clone(),
            model: record.model.clone(),
            history: history.clone(),
        };
        let session = Session::resumed(&record.id, record.created_at, record.stats);

        inner.session = Some(session);
        inner.params = Some(params.clone());
        // Re-arm the replay gate: a prior lifetime that ended in `Failed`
        // (no `stop()` ran) must not suppress this lifetime's replay.
        inner.history_replayed = false;

        info!(%session_id, entries = history.len(), "session resuming");
        self.bus.publish(&SessionEvent::Started {
            session_id: session_id.to_owned(),
        });

        // One-shot: even if resume bookkeeping runs again within this
        // lifetime, the history is never replayed twice.
        if !inner.history_replayed {
            inner.history_replayed = true;
            self.bus
                .publish(&SessionEvent::HistoryReplay { messages: history });
        }

        self.create_initial_worker(&mut inner, &params).await?;
        Ok(session_id.to_owned())
    }

    /// Forward a prompt to the active worker.
    ///
    /// Suspends until the worker accepts the prompt; prompts are never
    /// queued or silently dropped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionEnded` unless the session is `Running`
    /// or `Unresponsive`, or `AppError::Prompt` if the worker rejects it.
    pub async fn prompt(&self, text: &str) -> Result<()> {
        let worker = {
            let inner = self.inner.lock().await;
            let Some(session) = inner.session.as_ref() else {
                return Err(AppError::SessionEnded("no session has been started".into()));
            };
            if !session.state.accepts_prompts() {
                return Err(AppError::SessionEnded(format!(
                    "session {} does not accept prompts in its current state",
                    session.id
                )));
            }
            inner
                .worker
                .clone()
                .ok_or_else(|| AppError::SessionEnded("no active worker".into()))?
        };
        // Lock released: a concurrent stop() must not wait on the worker.
        worker.prompt(text).await
    }

    /// Cancel the in-flight prompt, if any. Idempotent; does not tear
    /// down the session.
    pub async fn abort(&self) {
        let worker = self.inner.lock().await.worker.clone();
        if let Some(worker) = worker {
            worker.abort().await;
        }
    }

    /// Stop the session: abort in-flight work, release the worker, halt
    /// probing, and transition to `Stopped`.
    ///
    /// Resets `restart_count` and the history-replay gate so a later
    /// resume of this session starts its bookkeeping fresh. Idempotent:
    /// a second call is a no-op that publishes nothing.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` covers future teardown I/O.
    pub async fn stop(&self) -> Result<()> {
        let worker = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.session.as_mut() else {
                return Ok(());
            };
            if session.state.is_terminal() {
                return Ok(());
            }
            let session_id = session.id.clone();
            Self::advance(session, SessionState::Stopped);
            session.restart_count = 0;
            inner.history_replayed = false;
            inner.epoch += 1;
            inner.cancel.cancel();
            inner.monitor = None;
            info!(%session_id, "session stopped");
            inner.worker.take()
        };

        if let Some(worker) = worker {
            worker.abort().await;
        }
        self.bus.publish(&SessionEvent::Stopped);
        Ok(())
    }

    /// Snapshot of the supervised session, if any.
    pub async fn session(&self) -> Option<Session> {
        self.inner.lock().await.session.clone()
    }

    /// Current lifecycle state, if a session exists.
    pub async fn current_state(&self) -> Option<SessionState> {
        self.inner.lock().await.session.as_ref().map(|s| s.state)
    }

    /// Cumulative stats of the supervised session, if any.
    pub async fn stats(&self) -> Option<SessionStats> {
        self.inner.lock().await.session.as_ref().map(|s| s.stats)
    }

    // ── internal ─────────────────────────────────────────

    fn ensure_no_active_session(inner: &Inner) -> Result<()> {
        if let Some(session) = inner.session.as_ref() {
            if !session.state.is_terminal() {
                return Err(AppError::Config(format!(
                    "session {} is already active",
                    session.id
                )));
            }
        }
        Ok(())
    }

    /// Checked state transition. Call sites only request transitions the
    /// state machine permits; violations are a programming error.
    fn advance(session: &mut Session, next: SessionState) {
        debug_assert!(
            session.state.can_transition_to(next),
            "illegal transition {:?} -> {next:?}",
            session.state
        );
        session.state = next;
    }

    /// Factory invocation for `start`/`resume`. A failure here means no
    /// worker ever existed: the session is failed without consuming a
    /// restart attempt and the error is returned to the caller.
    async fn create_initial_worker(
        self: &Arc<Self>,
        inner: &mut Inner,
        params: &WorkerParams,
    ) -> Result<()> {
        match self.factory.create(params).await {
            Ok(worker) => {
                self.attach_worker(inner, worker);
                if let Some(session) = inner.session.as_mut() {
                    Self::advance(session, SessionState::Running);
                    info!(session_id = %session.id, "worker ready");
                }
                Ok(())
            }
            Err(err) => {
                if let Some(session) = inner.session.as_mut() {
                    Self::advance(session, SessionState::Restarting);
                    Self::advance(session, SessionState::Failed);
                    warn!(session_id = %session.id, %err, "worker factory failed at session start");
                }
                self.bus.publish(&SessionEvent::Failed {
                    error: format!("worker could not be created: {err}"),
                });
                Err(err)
            }
        }
    }

    /// Bind a new worker instance: bump the epoch, re-arm cancellation,
    /// and spawn the event forwarder, health monitor, and health consumer.
    fn attach_worker(self: &Arc<Self>, inner: &mut Inner, worker: Arc<dyn WorkerHandle>) {
        inner.cancel.cancel();
        inner.epoch += 1;
        let epoch = inner.epoch;
        let cancel = CancellationToken::new();
        inner.cancel = cancel.clone();

        let session_id = inner
            .session
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_default();

        let events = worker.subscribe();
        tokio::spawn(Arc::clone(self).forward_worker_events(epoch, events, cancel.clone()));

        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHANNEL_CAPACITY);
        let monitor = HealthMonitor::new(
            session_id,
            Arc::clone(&worker),
            self.config.probe_interval(),
            self.config.probe_timeout(),
            self.config.health.miss_threshold,
            health_tx,
            cancel.clone(),
        )
        .spawn();
        inner.monitor = Some(monitor);
        tokio::spawn(Arc::clone(self).consume_health_events(epoch, health_rx, cancel));

        inner.worker = Some(worker);
    }

    /// Pump worker events into the bus, in emission order, accumulating
    /// stats and persisting along the way. A crash signal (explicit or a
    /// closed stream) hands off to the recovery path and ends the task.
    async fn forward_worker_events(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => event,
            };

            match event {
                Some(WorkerEvent::Crashed { error }) => {
                    self.handle_crash(epoch, error).await;
                    return;
                }
                Some(event) => {
                    self.record_worker_event(epoch, &event).await;
                    self.bus.publish(&SessionEvent::Worker(event));
                }
                None => {
                    self.handle_crash(epoch, "worker event stream closed unexpectedly".into())
                        .await;
                    return;
                }
            }
        }
    }

    /// Fold one worker event into session stats and persist the snapshot
    /// plus an append-only history entry.
    async fn record_worker_event(&self, epoch: u64, event: &WorkerEvent) {
        let (session_id, stats) = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            match event {
                WorkerEvent::Message { .. } => session.stats.messages += 1,
                WorkerEvent::Usage {
                    input_tokens,
                    output_tokens,
                    cost_usd,
                } => {
                    session.stats.input_tokens += *input_tokens;
                    session.stats.output_tokens += *output_tokens;
                    session.stats.cost_usd += *cost_usd;
                }
                WorkerEvent::DocumentComplete { .. } | WorkerEvent::Crashed { .. } => {}
            }
            (session.id.clone(), session.stats)
        };

        if let Err(err) = self.store.update_stats(&session_id, &stats).await {
            warn!(%err, %session_id, "failed to persist session stats");
        }
        match serde_json::to_value(event) {
            Ok(payload) => {
                if let Err(err) = self.store.append_history(&session_id, &payload).await {
                    warn!(%err, %session_id, "failed to append history entry");
                }
            }
            Err(err) => warn!(%err, %session_id, "worker event not serializable"),
        }
    }

    /// Recovery path for an unexpected worker termination.
    ///
    /// Captures a [`RestartAttempt`], consults the restart policy, and
    /// either replaces the worker (publishing `restarted` first, so
    /// subscribers can show recovering state) or fails the session with
    /// a terminal `failed` event. Factory errors during this sequence
    /// consume attempts through the same counter.
    async fn handle_crash(self: Arc<Self>, epoch: u64, initial_error: String) {
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return;
            }
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            if session.state.is_terminal() || session.state == SessionState::Restarting {
                return;
            }
            warn!(session_id = %session.id, error = %initial_error, "worker crashed");
            Self::advance(session, SessionState::Restarting);
            inner.cancel.cancel();
            inner.monitor = None;
            inner.worker = None;
        }

        let mut last_error = initial_error;
        loop {
            let attempt = {
                let mut inner = self.inner.lock().await;
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                if session.state != SessionState::Restarting {
                    // An explicit stop won the race.
                    return;
                }
                session.restart_count + 1
            };

            match self.policy.decide(attempt) {
                RestartDecision::GiveUp => {
                    let summary = {
                        let mut inner = self.inner.lock().await;
                        let Some(session) = inner.session.as_mut() else {
                            return;
                        };
                        if session.state != SessionState::Restarting {
                            return;
                        }
                        Self::advance(session, SessionState::Failed);
                        let summary = format!(
                            "session failed after {} restart attempt(s); last error: {last_error}",
                            session.restart_count
                        );
                        warn!(session_id = %session.id, %summary, "giving up on worker");
                        summary
                    };
                    self.bus.publish(&SessionEvent::Failed { error: summary });
                    return;
                }
                RestartDecision::Retry { delay } => {
                    let restart = {
                        let mut inner = self.inner.lock().await;
                        let Some(session) = inner.session.as_mut() else {
                            return;
                        };
                        if session.state != SessionState::Restarting {
                            return;
                        }
                        session.restart_count = attempt;
                        RestartAttempt {
                            attempt,
                            error: last_error.clone(),
                            at: Utc::now(),
                        }
                    };
                    // `restarted` precedes any event of the replacement
                    // worker.
                    self.bus.publish(&SessionEvent::Restarted {
                        attempt: restart.attempt,
                        previous_error: restart.error,
                    });

                    tokio::time::sleep(delay).await;

                    let params = {
                        let mut inner = self.inner.lock().await;
                        let Some(session) = inner.session.as_mut() else {
                            return;
                        };
                        if session.state != SessionState::Restarting {
                            return;
                        }
                        Self::advance(session, SessionState::Starting);
                        inner.params.clone().unwrap_or_default()
                    };

                    match self.factory.create(&params).await {
                        Ok(worker) => {
                            let mut inner = self.inner.lock().await;
                            let Some(session) = inner.session.as_mut() else {
                                return;
                            };
                            if session.state != SessionState::Starting {
                                // Stopped while the factory ran; discard.
                                return;
                            }
                            let session_id = session.id.clone();
                            let count = session.restart_count;
                            self.attach_worker(&mut inner, worker);
                            if let Some(session) = inner.session.as_mut() {
                                Self::advance(session, SessionState::Running);
                            }
                            info!(
                                %session_id,
                                restart_count = count,
                                "replacement worker ready"
                            );
                            return;
                        }
                        Err(err) => {
                            // Counts as a consumed attempt; loop again.
                            let mut inner = self.inner.lock().await;
                            let Some(session) = inner.session.as_mut() else {
                                return;
                            };
                            if session.state != SessionState::Starting {
                                return;
                            }
                            Self::advance(session, SessionState::Restarting);
                            last_error = err.to_string();
                        }
                    }
                }
            }
        }
    }

    /// Map health monitor signals onto the `Running <-> Unresponsive`
    /// pair of states. Never triggers a restart.
    async fn consume_health_events(
        self: Arc<Self>,
        epoch: u64,
        mut events: mpsc::Receiver<HealthEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else { return };

            let publish = {
                let mut inner = self.inner.lock().await;
                if inner.epoch != epoch {
                    return;
                }
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                match event {
                    HealthEvent::Unresponsive { missed }
                        if session.state == SessionState::Running =>
                    {
                        Self::advance(session, SessionState::Unresponsive);
                        warn!(
                            session_id = %session.id,
                            missed, "session marked unresponsive"
                        );
                        Some(SessionEvent::Unresponsive)
                    }
                    HealthEvent::Recovered if session.state == SessionState::Unresponsive => {
                        Self::advance(session, SessionState::Running);
                        info!(session_id = %session.id, "session recovered");
                        Some(SessionEvent::Recovered)
                    }
                    HealthEvent::Unresponsive { .. } | HealthEvent::Recovered => None,
                }
            };

            if let Some(event) = publish {
                self.bus.publish(&event);
            }
        }
    }
}

#![allow(dead_code)] // Each test module uses a different slice of the kit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use deepdive_supervisor::bus::{SessionEvent, Subscription};
use deepdive_supervisor::config::GlobalConfig;
use deepdive_supervisor::models::session::SessionState;
use deepdive_supervisor::persistence::db;
use deepdive_supervisor::persistence::resume_repo::ResumeRepo;
use deepdive_supervisor::repair::DiagramValidator;
use deepdive_supervisor::supervisor::session::SessionSupervisor;
use deepdive_supervisor::worker::{
    WorkerEvent, WorkerFactory, WorkerHandle, WorkerParams, WorkerStats,
};
use deepdive_supervisor::{AppError, Result};

/// Scripted worker: tests drive it by emitting events and flipping its
/// probe responsiveness.
pub struct FakeWorker {
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<WorkerEvent>>>,
    prompts: StdMutex<Vec<String>>,
    aborts: AtomicU32,
    responsive: AtomicBool,
    /// Documents emitted automatically in response to the next prompts,
    /// oldest first. Lets repair tests script worker corrections.
    queued_documents: StdMutex<VecDeque<String>>,
}

impl FakeWorker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: StdMutex::new(Vec::new()),
            prompts: StdMutex::new(Vec::new()),
            aborts: AtomicU32::new(0),
            responsive: AtomicBool::new(true),
            queued_documents: StdMutex::new(VecDeque::new()),
        })
    }

    pub fn emit(&self, event: WorkerEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn crash(&self, error: &str) {
        self.emit(WorkerEvent::Crashed {
            error: error.to_owned(),
        });
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn queue_document(&self, markdown: &str) {
        self.queued_documents
            .lock()
            .unwrap()
            .push_back(markdown.to_owned());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn prompt_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn abort_count(&self) -> u32 {
        self.aborts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerHandle for FakeWorker {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WorkerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    async fn prompt(&self, text: &str) -> Result<()> {
        self.prompts.lock().unwrap().push(text.to_owned());
        let queued = self.queued_documents.lock().unwrap().pop_front();
        if let Some(markdown) = queued {
            self.emit(WorkerEvent::DocumentComplete { markdown });
        }
        Ok(())
    }

    async fn abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    async fn stats(&self) -> Result<WorkerStats> {
        if self.responsive.load(Ordering::SeqCst) {
            return Ok(WorkerStats::default());
        }
        // A stalled worker never answers the probe.
        std::future::pending::<()>().await;
        Ok(WorkerStats::default())
    }
}

/// Factory producing [`FakeWorker`]s, with scriptable creation failures.
pub struct FakeFactory {
    workers: StdMutex<Vec<Arc<FakeWorker>>>,
    params_seen: StdMutex<Vec<WorkerParams>>,
    failures_remaining: AtomicU32,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workers: StdMutex::new(Vec::new()),
            params_seen: StdMutex::new(Vec::new()),
            failures_remaining: AtomicU32::new(0),
        })
    }

    /// Fail the next `count` create calls before succeeding again.
    pub fn fail_times(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn worker(&self, index: usize) -> Arc<FakeWorker> {
        Arc::clone(&self.workers.lock().unwrap()[index])
    }

    pub fn latest(&self) -> Arc<FakeWorker> {
        let workers = self.workers.lock().unwrap();
        Arc::clone(workers.last().expect("no worker created yet"))
    }

    pub fn params_seen(&self) -> Vec<WorkerParams> {
        self.params_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerFactory for FakeFactory {
    async fn create(&self, params: &WorkerParams) -> Result<Arc<dyn WorkerHandle>> {
        self.params_seen.lock().unwrap().push(params.clone());
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::WorkerCreation("scripted factory failure".into()));
        }
        let worker = FakeWorker::new();
        self.workers.lock().unwrap().push(Arc::clone(&worker));
        Ok(worker)
    }
}

/// Validator that rejects any diagram source containing `%% broken`.
pub struct FakeValidator {
    calls: AtomicU32,
}

impl FakeValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagramValidator for FakeValidator {
    async fn validate(&self, source: &str) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if source.contains("%% broken") {
            return Err(AppError::Validation("parse error near '%% broken'".into()));
        }
        Ok(())
    }
}

/// Config tuned for fast tests: millisecond backoff, probing effectively
/// disabled unless a test overrides the health section.
pub fn fast_config() -> GlobalConfig {
    let mut config = GlobalConfig::default();
    config.restart.base_delay_ms = 5;
    config.restart.max_delay_ms = 20;
    config.health.probe_interval_seconds = 600;
    config.health.probe_timeout_seconds = 1;
    config
}

pub fn start_params(prompt: &str) -> WorkerParams {
    WorkerParams {
        prompt: prompt.to_owned(),
        scope: None,
        model: None,
        history: Vec::new(),
    }
}

pub async fn supervisor_with(
    config: GlobalConfig,
) -> (Arc<SessionSupervisor>, Arc<FakeFactory>, ResumeRepo) {
    let pool = db::connect_memory().await.unwrap();
    let store = ResumeRepo::new(pool);
    let factory = FakeFactory::new();
    let factory_dyn: Arc<dyn WorkerFactory> = factory.clone();
    let supervisor = SessionSupervisor::new(Arc::new(config), factory_dyn, store.clone());
    (supervisor, factory, store)
}

pub type RecordedEvents = Arc<StdMutex<Vec<SessionEvent>>>;

/// Subscribe a recorder; keep the returned subscription alive for the
/// duration of the assertions.
pub fn record_events(supervisor: &SessionSupervisor) -> (Subscription, RecordedEvents) {
    let events: RecordedEvents = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = supervisor.subscribe(Box::new(move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    }));
    (subscription, events)
}

pub fn snapshot(events: &RecordedEvents) -> Vec<SessionEvent> {
    events.lock().unwrap().clone()
}

pub fn count_matching(events: &RecordedEvents, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
    events.lock().unwrap().iter().filter(|e| predicate(e)).count()
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub async fn wait_for_state(
    supervisor: &SessionSupervisor,
    state: SessionState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if supervisor.current_state().await == Some(state) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    supervisor.current_state().await == Some(state)
}

//! Test doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use url::Url;

use sworker::{
    ContextConfig, ControlMessage, EventEnvelope, FetchOutcome, InMemoryScriptCache,
    MemoryRegistrationStore, ProcessChannel, ProcessId, ProcessProvider, Result, ScriptCacheWriter,
    ScriptId, ServiceWorkerContext, ServiceWorkerError, ThreadId, WorkerEvent,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn url(path: &str) -> Url {
    Url::parse("https://example.test/").unwrap().join(path).unwrap()
}

/// Host process that records control messages and confirms starts and stops
pub struct FakeProcess {
    pub process_id: ProcessId,
    received: Arc<Mutex<Vec<ControlMessage>>>,
    responding: Arc<AtomicBool>,
}

impl FakeProcess {
    pub async fn attach(ctx: &ServiceWorkerContext, process_id: ProcessId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
        let channel: Arc<dyn ProcessChannel> = Arc::new(tx);
        ctx.register_process_channel(process_id, channel).await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let responding = Arc::new(AtomicBool::new(true));
        let (log, respond, ctx) = (received.clone(), responding.clone(), ctx.clone());
        tokio::spawn(async move {
            let mut next_thread = 100;
            while let Some(message) = rx.recv().await {
                log.lock().push(message.clone());
                if !respond.load(Ordering::SeqCst) {
                    continue;
                }
                match message {
                    ControlMessage::StartWorker { instance_id, .. } => {
                        next_thread += 1;
                        let _ = ctx
                            .on_worker_started(process_id, ThreadId(next_thread), instance_id)
                            .await;
                    }
                    ControlMessage::StopWorker { instance_id } => {
                        let _ = ctx.on_worker_stopped(process_id, instance_id).await;
                    }
                    ControlMessage::SendMessageToWorker { .. } => {}
                }
            }
        });

        Self {
            process_id,
            received,
            responding,
        }
    }

    /// Stop confirming starts and stops; messages are still recorded
    pub fn pause(&self) {
        self.responding.store(false, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ControlMessage> {
        self.received.lock().clone()
    }

    pub fn start_count(&self) -> usize {
        self.received()
            .iter()
            .filter(|m| matches!(m, ControlMessage::StartWorker { .. }))
            .count()
    }
}

/// Provider that always hands out one pre-registered process
pub struct FakeProvider {
    process_id: ProcessId,
    fail: AtomicBool,
    open: watch::Sender<bool>,
    pub released_hints: Mutex<Vec<ProcessId>>,
    pub released_processes: Mutex<Vec<ProcessId>>,
}

impl FakeProvider {
    pub fn new(process_id: ProcessId) -> Self {
        Self {
            process_id,
            fail: AtomicBool::new(false),
            open: watch::channel(true).0,
            released_hints: Mutex::new(Vec::new()),
            released_processes: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_allocations(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Park allocations until `open_allocations` is called
    pub fn hold_allocations(&self) {
        self.open.send_replace(false);
    }

    pub fn open_allocations(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl ProcessProvider for FakeProvider {
    async fn select_or_create_process(
        &self,
        _script_url: &Url,
        hint: Option<ProcessId>,
    ) -> Result<ProcessId> {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::StartWorkerFailed {
                reason: "no process available".into(),
            });
        }
        Ok(hint.unwrap_or(self.process_id))
    }

    async fn release_hint(&self, process_id: ProcessId) {
        self.released_hints.lock().push(process_id);
    }

    async fn release_process(&self, process_id: ProcessId) {
        self.released_processes.lock().push(process_id);
    }
}

/// Script cache that can hold fetches until released
pub struct GatedScripts {
    pub inner: InMemoryScriptCache,
    open: watch::Sender<bool>,
}

impl GatedScripts {
    pub fn new() -> Self {
        let (open, _) = watch::channel(true);
        Self {
            inner: InMemoryScriptCache::new(),
            open,
        }
    }

    pub fn close(&self) {
        self.open.send_replace(false);
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }
}

#[async_trait]
impl ScriptCacheWriter for GatedScripts {
    async fn fetch_and_cache(&self, script_url: &Url, incumbent: Option<ScriptId>) -> FetchOutcome {
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|open| *open).await;
        self.inner.fetch_and_cache(script_url, incumbent).await
    }
}

pub struct Harness {
    pub ctx: ServiceWorkerContext,
    pub store: Arc<MemoryRegistrationStore>,
    pub scripts: Arc<GatedScripts>,
    pub provider: Arc<FakeProvider>,
    pub process: FakeProcess,
}

pub async fn harness() -> Harness {
    harness_with(ContextConfig::default()).await
}

pub async fn harness_with(config: ContextConfig) -> Harness {
    init_tracing();
    let store = Arc::new(MemoryRegistrationStore::new());
    let scripts = Arc::new(GatedScripts::new());
    scripts.inner.serve(&url("/app/sw.js"), "// v1");
    scripts.inner.serve(&url("/app/sw2.js"), "// other script");
    scripts.inner.serve(&url("/other/sw.js"), "// other scope");
    let provider = Arc::new(FakeProvider::new(ProcessId(1)));

    let ctx = ServiceWorkerContext::builder()
        .config(config)
        .store(store.clone())
        .scripts(scripts.clone())
        .process_provider(provider.clone())
        .spawn()
        .unwrap();
    let process = FakeProcess::attach(&ctx, ProcessId(1)).await;

    Harness {
        ctx,
        store,
        scripts,
        provider,
        process,
    }
}

/// Receive events until one matches
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<EventEnvelope>,
    mut matches: F,
) -> WorkerEvent
where
    F: FnMut(&WorkerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(envelope) if matches(&envelope.event) => return envelope.event,
                Ok(_) => continue,
                Err(err) => panic!("event stream failed: {}", err),
            }
        }
    })
    .await
    .expect("timed out waiting for worker event")
}

/// Drain everything already published
pub fn drain(events: &mut broadcast::Receiver<EventEnvelope>) -> Vec<WorkerEvent> {
    std::iter::from_fn(|| events.try_recv().ok())
        .map(|envelope| envelope.event)
        .collect()
}

/// Let spawned fakes catch up with messages already sent to them
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use url::Url;

use super::actor::ContextCore;
use super::commands::{ContextCommand, NewVersion};
use crate::core::config::ContextConfig;
use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{
    InstanceId, JobId, ProcessId, RegistrationId, RequestId, ScriptId, ThreadId, VersionId,
};
use crate::job::{JobKind, JobRequest, JobResult};
use crate::process::ProcessProvider;
use crate::script_cache::{InMemoryScriptCache, ScriptCacheWriter};
use crate::storage::{MemoryRegistrationStore, Registration, RegistrationStore};
use crate::version::ServiceWorkerVersion;
use crate::worker::{EventBus, EventEnvelope, InstanceInfo, ProcessChannel, WorkerMessage};

/// Cloneable handle to a running service worker context
///
/// Every operation is a message to the context core. Once the core has shut
/// down, operations fail with [`ServiceWorkerError::Abort`].
#[derive(Clone)]
pub struct ServiceWorkerContext {
    commands: mpsc::Sender<ContextCommand>,
    events: EventBus,
}

impl ServiceWorkerContext {
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub(crate) fn from_parts(commands: mpsc::Sender<ContextCommand>, events: EventBus) -> Self {
        Self { commands, events }
    }

    async fn send(&self, operation: &str, command: ContextCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ServiceWorkerError::abort(operation))
    }

    async fn request<T>(
        &self,
        operation: &str,
        command: impl FnOnce(oneshot::Sender<T>) -> ContextCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(operation, command(tx)).await?;
        rx.await.map_err(|_| ServiceWorkerError::abort(operation))
    }

    async fn schedule(&self, request: JobRequest, hint: Option<ProcessId>) -> JobResult {
        self.request("schedule job", |waiter| ContextCommand::ScheduleJob {
            request,
            hint,
            waiter,
        })
        .await?
    }

    /// Register `script_url` for `scope`, reusing an equal registration.
    ///
    /// `hint` offers a process the caller already has; it is used for the
    /// worker start if this call is the first to supply one.
    pub async fn register(
        &self,
        scope: Url,
        script_url: Url,
        hint: Option<ProcessId>,
    ) -> Result<Registration> {
        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::InvalidScope {
                scope: scope.to_string(),
                reason: format!("script {} is on a different origin", script_url),
            });
        }
        self.schedule(
            JobRequest {
                scope,
                kind: JobKind::Register { script_url },
            },
            hint,
        )
        .await
    }

    pub async fn unregister(&self, scope: Url) -> Result<()> {
        self.schedule(
            JobRequest {
                scope,
                kind: JobKind::Unregister,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    /// Check the scope's script for changes and install a new version if any.
    ///
    /// Fails with `ScriptUnchanged` when the script is byte-identical.
    pub async fn update(&self, scope: Url, force: bool) -> Result<Registration> {
        self.schedule(
            JobRequest {
                scope,
                kind: JobKind::Update { force },
            },
            None,
        )
        .await
    }

    pub async fn send_to_worker(
        &self,
        version_id: VersionId,
        request_id: RequestId,
        message: WorkerMessage,
    ) -> Result<()> {
        self.request("send to worker", |reply| ContextCommand::SendToWorker {
            version_id,
            request_id,
            message,
            reply,
        })
        .await?
    }

    /// Start a version's worker again after it stopped
    pub async fn start_worker(
        &self,
        version_id: VersionId,
        hint: Option<ProcessId>,
    ) -> Result<ProcessId> {
        self.request("start worker", |reply| ContextCommand::StartWorker {
            version_id,
            hint,
            reply,
        })
        .await?
    }

    pub async fn stop_worker(&self, version_id: VersionId) -> Result<()> {
        self.request("stop worker", |reply| ContextCommand::StopWorker { version_id, reply })
            .await?
    }

    pub async fn add_process_reference(
        &self,
        version_id: VersionId,
        process_id: ProcessId,
    ) -> Result<()> {
        self.request("add process reference", |reply| {
            ContextCommand::AddProcessReference {
                version_id,
                process_id,
                reply,
            }
        })
        .await?
    }

    pub async fn release_process_reference(
        &self,
        version_id: VersionId,
        process_id: ProcessId,
    ) -> Result<()> {
        self.request("release process reference", |reply| {
            ContextCommand::ReleaseProcessReference {
                version_id,
                process_id,
                reply,
            }
        })
        .await?
    }

    /// A host process reports that a worker booted
    pub async fn on_worker_started(
        &self,
        process_id: ProcessId,
        thread_id: ThreadId,
        instance_id: InstanceId,
    ) -> Result<()> {
        self.send(
            "worker started",
            ContextCommand::WorkerStarted {
                process_id,
                thread_id,
                instance_id,
            },
        )
        .await
    }

    /// A host process reports that a worker shut down
    pub async fn on_worker_stopped(
        &self,
        process_id: ProcessId,
        instance_id: InstanceId,
    ) -> Result<()> {
        self.send(
            "worker stopped",
            ContextCommand::WorkerStopped {
                process_id,
                instance_id,
            },
        )
        .await
    }

    pub async fn on_message_from_worker(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        message: WorkerMessage,
    ) -> Result<()> {
        self.send(
            "message from worker",
            ContextCommand::MessageFromWorker {
                instance_id,
                request_id,
                message,
            },
        )
        .await
    }

    pub async fn register_process_channel(
        &self,
        process_id: ProcessId,
        channel: Arc<dyn ProcessChannel>,
    ) -> Result<()> {
        self.request("register process channel", |reply| {
            ContextCommand::RegisterProcessChannel {
                process_id,
                channel,
                reply,
            }
        })
        .await?
    }

    /// Forget a process; every worker it hosted is reported stopped
    pub async fn remove_process_channel(&self, process_id: ProcessId) -> Result<Vec<InstanceId>> {
        self.request("remove process channel", |reply| {
            ContextCommand::RemoveProcessChannel { process_id, reply }
        })
        .await?
    }

    pub async fn instance_info(&self, instance_id: InstanceId) -> Result<Option<InstanceInfo>> {
        self.request("instance info", |reply| ContextCommand::InstanceInfo {
            instance_id,
            reply,
        })
        .await
    }

    pub async fn version_info(
        &self,
        version_id: VersionId,
    ) -> Result<Option<ServiceWorkerVersion>> {
        self.request("version info", |reply| ContextCommand::VersionInfo { version_id, reply })
            .await
    }

    pub async fn process_affinity(&self, process_id: ProcessId) -> Result<usize> {
        self.request("process affinity", |reply| ContextCommand::ProcessAffinity {
            process_id,
            reply,
        })
        .await
    }

    /// Process the affinity heuristic would place an unhinted worker in
    pub async fn select_process(&self) -> Result<Option<ProcessId>> {
        self.request("select process", |reply| ContextCommand::SelectProcess { reply })
            .await
    }

    /// Context-wide worker events
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Events of one instance; `None` if it does not exist
    pub async fn subscribe_instance(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<broadcast::Receiver<EventEnvelope>>> {
        self.request("subscribe instance", |reply| ContextCommand::SubscribeInstance {
            instance_id,
            reply,
        })
        .await
    }

    /// Stop every worker and the context core
    pub async fn shutdown(&self) -> Result<()> {
        self.request("shutdown", |reply| ContextCommand::Shutdown { reply })
            .await?
    }

    pub(crate) async fn job_finished(&self, scope: Url, job_id: JobId, result: JobResult) {
        let command = ContextCommand::JobFinished {
            scope,
            job_id,
            result,
        };
        if self.commands.send(command).await.is_err() {
            debug!(job_id = %job_id, "Context gone before job finished");
        }
    }

    pub(crate) async fn start_new_version(
        &self,
        version_id: VersionId,
        registration_id: RegistrationId,
        script_url: Url,
        script_id: ScriptId,
        hint: Option<ProcessId>,
    ) -> Result<ProcessId> {
        self.request("start new version", |reply| ContextCommand::StartNewVersion {
            version: NewVersion {
                version_id,
                registration_id,
                script_url,
                script_id,
            },
            hint,
            reply,
        })
        .await?
    }

    pub(crate) async fn retire_version(&self, version_id: VersionId) -> Result<()> {
        self.request("retire version", |reply| ContextCommand::RetireVersion { version_id, reply })
            .await?
    }

    pub(crate) async fn retire_registration(&self, registration_id: RegistrationId) -> Result<()> {
        self.request("retire registration", |reply| {
            ContextCommand::RetireRegistration {
                registration_id,
                reply,
            }
        })
        .await?
    }
}

/// Builder for a [`ServiceWorkerContext`]
///
/// The store and script cache default to in-memory implementations; a process
/// provider is required.
#[derive(Default)]
pub struct ContextBuilder {
    config: ContextConfig,
    store: Option<Arc<dyn RegistrationStore>>,
    scripts: Option<Arc<dyn ScriptCacheWriter>>,
    provider: Option<Arc<dyn ProcessProvider>>,
}

impl ContextBuilder {
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn RegistrationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scripts(mut self, scripts: Arc<dyn ScriptCacheWriter>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    pub fn process_provider(mut self, provider: Arc<dyn ProcessProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Validate, then spawn the context core on the current tokio runtime
    pub fn spawn(self) -> Result<ServiceWorkerContext> {
        self.config.validate()?;
        let provider = self.provider.ok_or_else(|| {
            ServiceWorkerError::configuration_field(
                "a process provider is required",
                "process_provider",
            )
        })?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRegistrationStore::new()));
        let scripts = self
            .scripts
            .unwrap_or_else(|| Arc::new(InMemoryScriptCache::new()));

        let (tx, rx) = mpsc::channel(self.config.command_buffer);
        let events = EventBus::new(self.config.event_capacity);
        let core = ContextCore::new(
            self.config,
            store,
            scripts,
            provider,
            events.clone(),
            rx,
            tx.downgrade(),
        );
        tokio::spawn(core.run());
        Ok(ServiceWorkerContext::from_parts(tx, events))
    }
}

//! The context actor
//!
//! Single owner of the worker registry, the version table and the job queues.
//! It applies [`ContextCommand`]s one at a time; everything asynchronous (jobs,
//! process allocation, collaborator calls) runs in spawned tasks that report
//! back as further commands.

use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;

use super::commands::{ContextCommand, NewVersion, Reply};
use super::handle::ServiceWorkerContext;
use crate::core::config::ContextConfig;
use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{InstanceId, JobId, ProcessId, RegistrationId, VersionId};
use crate::job::{self, JobContext, JobCoordinator, ReadyJob};
use crate::process::ProcessProvider;
use crate::script_cache::ScriptCacheWriter;
use crate::storage::RegistrationStore;
use crate::version::{ServiceWorkerVersion, VersionStatus, VersionTable};
use crate::worker::{EventBus, StartDispatch, WorkerRegistry, WorkerStatus};

pub(crate) struct ContextCore {
    config: ContextConfig,
    registry: WorkerRegistry,
    versions: VersionTable,
    jobs: JobCoordinator,
    /// Instances of redundant versions waiting for their stop confirmation
    retiring: HashSet<InstanceId>,
    store: Arc<dyn RegistrationStore>,
    scripts: Arc<dyn ScriptCacheWriter>,
    provider: Arc<dyn ProcessProvider>,
    events: EventBus,
    commands: mpsc::Receiver<ContextCommand>,
    self_sender: mpsc::WeakSender<ContextCommand>,
}

impl ContextCore {
    pub(crate) fn new(
        config: ContextConfig,
        store: Arc<dyn RegistrationStore>,
        scripts: Arc<dyn ScriptCacheWriter>,
        provider: Arc<dyn ProcessProvider>,
        events: EventBus,
        commands: mpsc::Receiver<ContextCommand>,
        self_sender: mpsc::WeakSender<ContextCommand>,
    ) -> Self {
        Self {
            registry: WorkerRegistry::new(&config, events.clone()),
            config,
            versions: VersionTable::new(),
            jobs: JobCoordinator::new(),
            retiring: HashSet::new(),
            store,
            scripts,
            provider,
            events,
            commands,
            self_sender,
        }
    }

    /// Apply commands until shutdown or until every handle is gone
    pub(crate) async fn run(mut self) {
        info!("Service worker context started");
        while let Some(command) = self.commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
        let hints = self.jobs.abort_all();
        for hint in hints {
            self.release_hint(hint);
        }
        info!("Service worker context stopped");
    }

    fn handle(&mut self, command: ContextCommand) -> bool {
        match command {
            ContextCommand::ScheduleJob {
                request,
                hint,
                waiter,
            } => {
                let enqueued = self.jobs.enqueue(request, hint, waiter);
                if let Some(hint) = enqueued.released_hint {
                    self.release_hint(hint);
                }
                if let Some(ready) = enqueued.ready {
                    self.spawn_job(ready);
                }
            }
            ContextCommand::JobFinished {
                scope,
                job_id,
                result,
            } => {
                match &result {
                    Ok(registration) => {
                        debug!(job_id = %job_id, registration_id = %registration.id, "Job finished")
                    }
                    Err(err) => {
                        info!(job_id = %job_id, category = err.category(), error = %err, "Job failed")
                    }
                }
                self.finish_job(scope.as_str(), job_id, result);
            }
            ContextCommand::StartNewVersion {
                version,
                hint,
                reply,
            } => self.start_new_version(version, hint, reply),
            ContextCommand::ProcessAllocated {
                instance_id,
                version_id,
                activate,
                allocation,
                reply,
            } => self.on_process_allocated(instance_id, version_id, activate, allocation, reply),
            ContextCommand::RetireVersion { version_id, reply } => {
                self.retire_version(version_id);
                let _ = reply.send(Ok(()));
            }
            ContextCommand::RetireRegistration {
                registration_id,
                reply,
            } => {
                self.retire_registration(registration_id);
                let _ = reply.send(Ok(()));
            }
            ContextCommand::StartWorker {
                version_id,
                hint,
                reply,
            } => {
                let target = self
                    .live_version(version_id)
                    .map(|version| (version.instance_id, version.script_url.clone()));
                match target {
                    Ok((instance_id, script_url)) => {
                        self.dispatch_start(instance_id, version_id, script_url, hint, false, reply)
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }
            ContextCommand::StopWorker { version_id, reply } => {
                let result = self
                    .instance_for(version_id)
                    .and_then(|instance_id| self.registry.stop_instance(instance_id));
                let _ = reply.send(result);
            }
            ContextCommand::SendToWorker {
                version_id,
                request_id,
                message,
                reply,
            } => {
                let result = self.instance_for(version_id).and_then(|instance_id| {
                    self.registry.send_message(instance_id, request_id, message)
                });
                let _ = reply.send(result);
            }
            ContextCommand::AddProcessReference {
                version_id,
                process_id,
                reply,
            } => {
                let result = self.instance_for(version_id).and_then(|instance_id| {
                    self.registry.add_process_reference(instance_id, process_id)
                });
                let _ = reply.send(result);
            }
            ContextCommand::ReleaseProcessReference {
                version_id,
                process_id,
                reply,
            } => {
                let result = self.instance_for(version_id).and_then(|instance_id| {
                    self.registry.release_process_reference(instance_id, process_id)
                });
                let _ = reply.send(result);
            }
            ContextCommand::WorkerStarted {
                process_id,
                thread_id,
                instance_id,
            } => self.registry.on_worker_started(process_id, thread_id, instance_id),
            ContextCommand::WorkerStopped {
                process_id,
                instance_id,
            } => {
                self.registry.on_worker_stopped(process_id, instance_id);
                self.reap_retired(instance_id);
            }
            ContextCommand::MessageFromWorker {
                instance_id,
                request_id,
                message,
            } => {
                self.registry
                    .on_message_from_worker(instance_id, request_id, message);
            }
            ContextCommand::RegisterProcessChannel {
                process_id,
                channel,
                reply,
            } => {
                self.registry.register_process_channel(process_id, channel);
                let _ = reply.send(Ok(()));
            }
            ContextCommand::RemoveProcessChannel { process_id, reply } => {
                let stopped = self.registry.remove_process_channel(process_id);
                for instance_id in &stopped {
                    self.reap_retired(*instance_id);
                }
                let _ = reply.send(Ok(stopped));
            }
            ContextCommand::InstanceInfo { instance_id, reply } => {
                let _ = reply.send(self.registry.instance_info(instance_id));
            }
            ContextCommand::VersionInfo { version_id, reply } => {
                let _ = reply.send(self.versions.get(version_id).cloned());
            }
            ContextCommand::ProcessAffinity { process_id, reply } => {
                let _ = reply.send(self.registry.process_affinity(process_id));
            }
            ContextCommand::SelectProcess { reply } => {
                let _ = reply.send(self.registry.select_process());
            }
            ContextCommand::SubscribeInstance { instance_id, reply } => {
                let _ = reply.send(self.registry.subscribe_instance(instance_id));
            }
            ContextCommand::Shutdown { reply } => {
                self.registry.shutdown();
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn live_version(&self, version_id: VersionId) -> Result<&ServiceWorkerVersion> {
        let version = self
            .versions
            .get(version_id)
            .ok_or_else(|| ServiceWorkerError::not_found(format!("version {}", version_id)))?;
        if version.status == VersionStatus::Redundant {
            return Err(ServiceWorkerError::invalid_state(
                "use worker",
                VersionStatus::Redundant,
            ));
        }
        Ok(version)
    }

    fn instance_for(&self, version_id: VersionId) -> Result<InstanceId> {
        self.versions
            .get(version_id)
            .map(|version| version.instance_id)
            .ok_or_else(|| ServiceWorkerError::not_found(format!("version {}", version_id)))
    }

    fn start_new_version(
        &mut self,
        version: NewVersion,
        hint: Option<ProcessId>,
        reply: Reply<ProcessId>,
    ) {
        let instance_id = self.registry.create_instance();
        self.versions.insert(ServiceWorkerVersion {
            id: version.version_id,
            registration_id: version.registration_id,
            script_url: version.script_url.clone(),
            status: VersionStatus::New,
            instance_id,
            script_id: Some(version.script_id),
        });
        debug!(version_id = %version.version_id, instance_id = %instance_id, "Created version");
        self.dispatch_start(
            instance_id,
            version.version_id,
            version.script_url,
            hint,
            true,
            reply,
        );
    }

    /// Start an instance, allocating a process asynchronously when needed.
    ///
    /// With `activate` set the version becomes ACTIVE once the start message is
    /// accepted, and is discarded if the start fails.
    fn dispatch_start(
        &mut self,
        instance_id: InstanceId,
        version_id: VersionId,
        script_url: Url,
        hint: Option<ProcessId>,
        activate: bool,
        reply: Reply<ProcessId>,
    ) {
        match self
            .registry
            .start_instance(instance_id, version_id, script_url.clone(), hint)
        {
            Ok(StartDispatch::Sent(process_id)) => {
                if activate {
                    self.activate(version_id);
                }
                let _ = reply.send(Ok(process_id));
            }
            Ok(StartDispatch::NeedsProcess) => {
                let Some(sender) = self.self_sender.upgrade() else {
                    self.fail_start(
                        version_id,
                        activate,
                        ServiceWorkerError::abort("start worker"),
                        reply,
                    );
                    return;
                };
                let provider = self.provider.clone();
                tokio::spawn(async move {
                    let allocation = provider.select_or_create_process(&script_url, None).await;
                    let command = ContextCommand::ProcessAllocated {
                        instance_id,
                        version_id,
                        activate,
                        allocation,
                        reply,
                    };
                    if let Err(mpsc::error::SendError(command)) = sender.send(command).await {
                        if let ContextCommand::ProcessAllocated {
                            allocation, reply, ..
                        } = command
                        {
                            if let Ok(process_id) = allocation {
                                provider.release_process(process_id).await;
                            }
                            let _ = reply.send(Err(ServiceWorkerError::abort("start worker")));
                        }
                    }
                });
            }
            Err(err) => {
                error!(instance_id = %instance_id, error = %err, "Failed to start worker");
                self.fail_start(version_id, activate, err, reply);
            }
        }
    }

    fn on_process_allocated(
        &mut self,
        instance_id: InstanceId,
        version_id: VersionId,
        activate: bool,
        allocation: Result<ProcessId>,
        reply: Reply<ProcessId>,
    ) {
        let allocated = allocation.as_ref().ok().copied();
        match self.registry.process_allocated(instance_id, allocation) {
            Ok(process_id) => {
                if activate {
                    self.activate(version_id);
                }
                let _ = reply.send(Ok(process_id));
            }
            Err(err) => {
                if let Some(process_id) = allocated {
                    debug!(process_id = %process_id, "Releasing unused process");
                    let provider = self.provider.clone();
                    tokio::spawn(async move { provider.release_process(process_id).await });
                }
                self.fail_start(version_id, activate, err, reply);
            }
        }
    }

    fn fail_start(
        &mut self,
        version_id: VersionId,
        activate: bool,
        err: ServiceWorkerError,
        reply: Reply<ProcessId>,
    ) {
        if activate {
            self.discard_version(version_id);
        }
        let _ = reply.send(Err(err));
    }

    fn activate(&mut self, version_id: VersionId) {
        if let Some(version) = self.versions.get_mut(version_id) {
            version.status = VersionStatus::Active;
            debug!(version_id = %version_id, "Version active");
        }
    }

    /// Mark a version redundant and tear down its worker.
    ///
    /// The version and instance are dropped once the worker is confirmed
    /// stopped, or right away if there is nothing to stop.
    fn retire_version(&mut self, version_id: VersionId) {
        let Some(version) = self.versions.get_mut(version_id) else {
            debug!(version_id = %version_id, "Retiring unknown version");
            return;
        };
        version.status = VersionStatus::Redundant;
        let instance_id = version.instance_id;

        let state = self
            .registry
            .instance_info(instance_id)
            .map(|info| (info.status, info.process_id));
        match state {
            Some((WorkerStatus::Starting | WorkerStatus::Running, Some(_))) => {
                match self.registry.stop_instance(instance_id) {
                    Ok(()) => {
                        self.retiring.insert(instance_id);
                    }
                    Err(err) => {
                        warn!(instance_id = %instance_id, error = %err, "Stop failed while retiring");
                        self.discard_version(version_id);
                    }
                }
            }
            Some((WorkerStatus::Stopping, _)) => {
                self.retiring.insert(instance_id);
            }
            _ => self.discard_version(version_id),
        }
        info!(version_id = %version_id, "Version retired");
    }

    fn retire_registration(&mut self, registration_id: RegistrationId) {
        for version_id in self.versions.live_for_registration(registration_id) {
            self.retire_version(version_id);
        }
    }

    fn reap_retired(&mut self, instance_id: InstanceId) {
        if !self.retiring.contains(&instance_id) {
            return;
        }
        let stopped = self
            .registry
            .instance_info(instance_id)
            .map_or(true, |info| info.status == WorkerStatus::Stopped);
        if stopped {
            if let Some(version_id) = self.versions.for_instance(instance_id) {
                self.discard_version(version_id);
            }
        }
    }

    fn discard_version(&mut self, version_id: VersionId) {
        if let Some(version) = self.versions.remove(version_id) {
            self.retiring.remove(&version.instance_id);
            self.registry.remove_instance(version.instance_id);
            debug!(version_id = %version_id, instance_id = %version.instance_id, "Version discarded");
        }
    }

    fn spawn_job(&mut self, ready: ReadyJob) {
        let Some(sender) = self.self_sender.upgrade() else {
            // Nobody is left to report back through; fail the rest of the queue.
            let mut next = Some(ready);
            while let Some(job) = next.take() {
                let finished = self.jobs.finish(
                    job.request.scope.as_str(),
                    job.id,
                    Err(ServiceWorkerError::abort("job")),
                );
                if let Some(hint) = finished.released_hint {
                    self.release_hint(hint);
                }
                next = finished.next;
            }
            return;
        };

        let ctx = JobContext {
            context: ServiceWorkerContext::from_parts(sender, self.events.clone()),
            store: self.store.clone(),
            scripts: self.scripts.clone(),
            start: ready.start,
            update_check_interval: self.config.update_check_interval,
        };
        let (job_id, request) = (ready.id, ready.request);
        info!(job_id = %job_id, scope = %request.scope, kind = %request.kind, "Starting job");
        tokio::spawn(async move {
            let result = AssertUnwindSafe(job::run(&ctx, &request))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(job_id = %job_id, "Job panicked");
                    Err(ServiceWorkerError::abort("job"))
                });
            ctx.context.job_finished(request.scope, job_id, result).await;
        });
    }

    fn finish_job(&mut self, scope: &str, job_id: JobId, result: job::JobResult) {
        let finished = self.jobs.finish(scope, job_id, result);
        if let Some(hint) = finished.released_hint {
            self.release_hint(hint);
        }
        if let Some(next) = finished.next {
            self.spawn_job(next);
        }
    }

    fn release_hint(&self, process_id: ProcessId) {
        let provider = self.provider.clone();
        tokio::spawn(async move { provider.release_hint(process_id).await });
    }
}

//! Commands accepted by the context core
//!
//! Anything that mutates the registry, the version table or the job queues is
//! a command. Replies travel back on oneshot channels.

use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use url::Url;

use crate::core::errors::Result;
use crate::core::ids::{
    InstanceId, JobId, ProcessId, RegistrationId, RequestId, ScriptId, ThreadId, VersionId,
};
use crate::job::coordinator::{JobResult, JobWaiter};
use crate::job::JobRequest;
use crate::version::ServiceWorkerVersion;
use crate::worker::{EventEnvelope, InstanceInfo, ProcessChannel, WorkerMessage};

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Version a job wants started
#[derive(Debug, Clone)]
pub(crate) struct NewVersion {
    pub version_id: VersionId,
    pub registration_id: RegistrationId,
    pub script_url: Url,
    pub script_id: ScriptId,
}

pub(crate) enum ContextCommand {
    // Jobs
    ScheduleJob {
        request: JobRequest,
        hint: Option<ProcessId>,
        waiter: JobWaiter,
    },
    JobFinished {
        scope: Url,
        job_id: JobId,
        result: JobResult,
    },
    StartNewVersion {
        version: NewVersion,
        hint: Option<ProcessId>,
        reply: Reply<ProcessId>,
    },
    ProcessAllocated {
        instance_id: InstanceId,
        version_id: VersionId,
        activate: bool,
        allocation: Result<ProcessId>,
        reply: Reply<ProcessId>,
    },
    RetireVersion {
        version_id: VersionId,
        reply: Reply<()>,
    },
    RetireRegistration {
        registration_id: RegistrationId,
        reply: Reply<()>,
    },

    // Worker control by version
    StartWorker {
        version_id: VersionId,
        hint: Option<ProcessId>,
        reply: Reply<ProcessId>,
    },
    StopWorker {
        version_id: VersionId,
        reply: Reply<()>,
    },
    SendToWorker {
        version_id: VersionId,
        request_id: RequestId,
        message: WorkerMessage,
        reply: Reply<()>,
    },
    AddProcessReference {
        version_id: VersionId,
        process_id: ProcessId,
        reply: Reply<()>,
    },
    ReleaseProcessReference {
        version_id: VersionId,
        process_id: ProcessId,
        reply: Reply<()>,
    },

    // Inbound from host processes
    WorkerStarted {
        process_id: ProcessId,
        thread_id: ThreadId,
        instance_id: InstanceId,
    },
    WorkerStopped {
        process_id: ProcessId,
        instance_id: InstanceId,
    },
    MessageFromWorker {
        instance_id: InstanceId,
        request_id: RequestId,
        message: WorkerMessage,
    },
    RegisterProcessChannel {
        process_id: ProcessId,
        channel: Arc<dyn ProcessChannel>,
        reply: Reply<()>,
    },
    RemoveProcessChannel {
        process_id: ProcessId,
        reply: Reply<Vec<InstanceId>>,
    },

    // Introspection
    InstanceInfo {
        instance_id: InstanceId,
        reply: oneshot::Sender<Option<InstanceInfo>>,
    },
    VersionInfo {
        version_id: VersionId,
        reply: oneshot::Sender<Option<ServiceWorkerVersion>>,
    },
    ProcessAffinity {
        process_id: ProcessId,
        reply: oneshot::Sender<usize>,
    },
    SelectProcess {
        reply: oneshot::Sender<Option<ProcessId>>,
    },
    SubscribeInstance {
        instance_id: InstanceId,
        reply: oneshot::Sender<Option<broadcast::Receiver<EventEnvelope>>>,
    },

    Shutdown {
        reply: Reply<()>,
    },
}

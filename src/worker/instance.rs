//! Worker instance state machine
//!
//! A [`WorkerInstance`] is the runtime presence of one worker version in some
//! host process. It moves STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED
//! and is only ever mutated by the registry that owns it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{InstanceId, ProcessId, RequestId, ThreadId, VersionId};
use crate::worker::events::{EventBus, EventEnvelope, WorkerEvent};
use crate::worker::messages::{ControlMessage, WorkerMessage};
use crate::worker::process_table::ProcessTable;

/// Lifecycle state of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Result of asking an instance to start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDispatch {
    /// The start message went out to a known process
    Sent(ProcessId),
    /// No process is known; one must be allocated asynchronously
    NeedsProcess,
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: InstanceId,
    pub status: WorkerStatus,
    pub version_id: Option<VersionId>,
    pub process_id: Option<ProcessId>,
    pub thread_id: Option<ThreadId>,
}

pub struct WorkerInstance {
    id: InstanceId,
    status: WorkerStatus,
    version_id: Option<VersionId>,
    script_url: Option<Url>,
    process_id: Option<ProcessId>,
    thread_id: Option<ThreadId>,
    /// Affinity hints from instances sharing a process, by reference count
    process_refs: BTreeMap<ProcessId, usize>,
    events: broadcast::Sender<EventEnvelope>,
    bus: EventBus,
}

impl WorkerInstance {
    pub(crate) fn new(id: InstanceId, bus: EventBus, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            id,
            status: WorkerStatus::Stopped,
            version_id: None,
            script_url: None,
            process_id: None,
            thread_id: None,
            process_refs: BTreeMap::new(),
            events,
            bus,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id
    }

    pub fn version_id(&self) -> Option<VersionId> {
        self.version_id
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            instance_id: self.id,
            status: self.status,
            version_id: self.version_id,
            process_id: self.process_id,
            thread_id: self.thread_id,
        }
    }

    /// Receive this instance's events only
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    /// Begin starting the worker.
    ///
    /// The process is chosen from the explicit hint, then this instance's own
    /// process references, then the registry-wide affinity heuristic. When none
    /// of those yields a process the caller must allocate one and report back
    /// through [`record_started_process`](Self::record_started_process).
    pub fn start(
        &mut self,
        processes: &mut ProcessTable,
        version_id: VersionId,
        script_url: Url,
        hint: Option<ProcessId>,
    ) -> Result<StartDispatch> {
        if self.status != WorkerStatus::Stopped {
            return Err(ServiceWorkerError::invalid_state("start", self.status));
        }
        self.status = WorkerStatus::Starting;
        self.version_id = Some(version_id);
        self.script_url = Some(script_url);

        let candidate = hint
            .or_else(|| self.preferred_process(processes))
            .or_else(|| processes.select_process());

        match candidate {
            Some(process_id) => {
                self.dispatch_start(processes, process_id)?;
                Ok(StartDispatch::Sent(process_id))
            }
            None => {
                debug!(instance_id = %self.id, "No known process, deferring to allocation");
                Ok(StartDispatch::NeedsProcess)
            }
        }
    }

    /// Complete a start that was waiting on process allocation
    pub fn record_started_process(
        &mut self,
        processes: &mut ProcessTable,
        allocation: Result<ProcessId>,
    ) -> Result<ProcessId> {
        if self.status != WorkerStatus::Starting || self.process_id.is_some() {
            return Err(ServiceWorkerError::invalid_state(
                "record allocated process",
                self.status,
            ));
        }
        match allocation {
            Ok(process_id) => {
                self.dispatch_start(processes, process_id)?;
                Ok(process_id)
            }
            Err(err) => {
                warn!(instance_id = %self.id, error = %err, "Process allocation failed");
                self.reset();
                Err(err)
            }
        }
    }

    fn dispatch_start(
        &mut self,
        processes: &mut ProcessTable,
        process_id: ProcessId,
    ) -> Result<()> {
        let (Some(version_id), Some(script_url)) = (self.version_id, self.script_url.clone()) else {
            return Err(ServiceWorkerError::invalid_state("start", "unversioned"));
        };
        self.process_id = Some(process_id);
        if let Err(err) = processes.start_worker(process_id, self.id, version_id, &script_url) {
            warn!(instance_id = %self.id, process_id = %process_id, error = %err, "Start dispatch failed");
            self.reset();
            return Err(err);
        }
        debug!(instance_id = %self.id, process_id = %process_id, "Start message sent");
        Ok(())
    }

    /// The hosting process confirmed the worker booted.
    ///
    /// Returns false when a stop raced the confirmation and already won.
    pub fn on_started(&mut self, thread_id: ThreadId) -> Result<bool> {
        match self.status {
            WorkerStatus::Stopping => {
                debug!(instance_id = %self.id, "Start confirmed after stop; ignoring");
                Ok(false)
            }
            WorkerStatus::Starting => {
                let Some(process_id) = self.process_id else {
                    return Err(ServiceWorkerError::invalid_state("confirm start", "unplaced"));
                };
                self.status = WorkerStatus::Running;
                self.thread_id = Some(thread_id);
                debug!(instance_id = %self.id, thread_id = %thread_id, "Worker running");
                self.publish(WorkerEvent::Started {
                    instance_id: self.id,
                    process_id,
                    thread_id,
                });
                Ok(true)
            }
            status => Err(ServiceWorkerError::invalid_state("confirm start", status)),
        }
    }

    /// Send the stop message; on failure the state is left unchanged
    pub fn stop(&mut self, processes: &mut ProcessTable) -> Result<()> {
        let process_id = match (self.status, self.process_id) {
            (WorkerStatus::Starting | WorkerStatus::Running, Some(process_id)) => process_id,
            (status, _) => return Err(ServiceWorkerError::invalid_state("stop", status)),
        };
        processes.stop_worker(process_id, self.id)?;
        self.status = WorkerStatus::Stopping;
        debug!(instance_id = %self.id, "Worker stopping");
        Ok(())
    }

    /// The worker is gone, confirmed or because its process disappeared
    pub fn on_stopped(&mut self) {
        self.reset();
        debug!(instance_id = %self.id, "Worker stopped");
        self.publish(WorkerEvent::Stopped {
            instance_id: self.id,
        });
    }

    pub fn send_message(
        &self,
        processes: &ProcessTable,
        request_id: RequestId,
        message: WorkerMessage,
    ) -> Result<()> {
        let (WorkerStatus::Running, Some(process_id), Some(thread_id)) =
            (self.status, self.process_id, self.thread_id)
        else {
            return Err(ServiceWorkerError::NotRunning {
                instance_id: self.id,
            });
        };
        processes.send(
            process_id,
            ControlMessage::SendMessageToWorker {
                thread_id,
                instance_id: self.id,
                request_id,
                message,
            },
        )
    }

    /// Deliver an inbound message from the worker to observers
    pub fn on_message(&self, request_id: RequestId, message: WorkerMessage) {
        self.publish(WorkerEvent::MessageReceived {
            instance_id: self.id,
            request_id,
            message,
        });
    }

    pub fn add_process_reference(&mut self, process_id: ProcessId) {
        *self.process_refs.entry(process_id).or_insert(0) += 1;
    }

    pub fn release_process_reference(&mut self, process_id: ProcessId) {
        match self.process_refs.get_mut(&process_id) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.process_refs.remove(&process_id);
            }
            None => warn!(
                instance_id = %self.id,
                process_id = %process_id,
                "Released a process reference that was never added"
            ),
        }
    }

    /// Referenced process with the most references that still has a channel
    fn preferred_process(&self, processes: &ProcessTable) -> Option<ProcessId> {
        let mut best: Option<(ProcessId, usize)> = None;
        for (process_id, count) in &self.process_refs {
            if !processes.contains(*process_id) {
                continue;
            }
            match best {
                Some((_, best_count)) if best_count >= *count => {}
                _ => best = Some((*process_id, *count)),
            }
        }
        best.map(|(process_id, _)| process_id)
    }

    fn reset(&mut self) {
        self.status = WorkerStatus::Stopped;
        self.process_id = None;
        self.thread_id = None;
    }

    fn publish(&self, event: WorkerEvent) {
        let envelope = self.bus.envelope(event);
        let _ = self.events.send(envelope.clone());
        self.bus.publish(&envelope);
    }
}

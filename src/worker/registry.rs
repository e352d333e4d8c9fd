//! Worker registry
//!
//! Directory of every [`WorkerInstance`] plus the [`ProcessTable`] they are
//! dispatched through. Inbound confirmations from host processes are routed
//! here and forwarded to the owning instance after a liveness check.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::ContextConfig;
use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{InstanceId, ProcessId, RequestId, ThreadId, VersionId};
use crate::worker::events::{EventBus, EventEnvelope};
use crate::worker::instance::{InstanceInfo, StartDispatch, WorkerInstance, WorkerStatus};
use crate::worker::messages::WorkerMessage;
use crate::worker::process_table::{ProcessChannel, ProcessTable};

pub struct WorkerRegistry {
    instances: BTreeMap<InstanceId, WorkerInstance>,
    processes: ProcessTable,
    next_instance_id: u64,
    config: ContextConfig,
    bus: EventBus,
}

impl WorkerRegistry {
    pub fn new(config: &ContextConfig, bus: EventBus) -> Self {
        Self {
            instances: BTreeMap::new(),
            processes: ProcessTable::new(),
            next_instance_id: 1,
            config: config.clone(),
            bus,
        }
    }

    /// Allocate a new, stopped instance; ids are never reused
    pub fn create_instance(&mut self) -> InstanceId {
        let id = InstanceId(self.next_instance_id);
        self.next_instance_id += 1;
        self.instances.insert(
            id,
            WorkerInstance::new(id, self.bus.clone(), self.config.event_capacity),
        );
        debug!(instance_id = %id, "Created worker instance");
        id
    }

    /// Delete an instance and every process reference to it.
    ///
    /// A still-live worker is sent a best-effort stop first.
    pub fn remove_instance(&mut self, instance_id: InstanceId) -> bool {
        let Some(mut instance) = self.instances.remove(&instance_id) else {
            return false;
        };
        if matches!(
            instance.status(),
            WorkerStatus::Starting | WorkerStatus::Running
        ) && instance.process_id().is_some()
        {
            if let Err(err) = instance.stop(&mut self.processes) {
                warn!(instance_id = %instance_id, error = %err, "Stop on removal failed");
            }
        }
        self.processes.forget_instance(instance_id);
        debug!(instance_id = %instance_id, "Removed worker instance");
        true
    }

    pub fn contains_instance(&self, instance_id: InstanceId) -> bool {
        self.instances.contains_key(&instance_id)
    }

    pub fn instance(&self, instance_id: InstanceId) -> Option<&WorkerInstance> {
        self.instances.get(&instance_id)
    }

    pub fn instance_info(&self, instance_id: InstanceId) -> Option<InstanceInfo> {
        self.instances.get(&instance_id).map(WorkerInstance::info)
    }

    pub fn subscribe_instance(
        &self,
        instance_id: InstanceId,
    ) -> Option<broadcast::Receiver<EventEnvelope>> {
        self.instances.get(&instance_id).map(WorkerInstance::subscribe)
    }

    fn instance_mut(&mut self, instance_id: InstanceId) -> Result<&mut WorkerInstance> {
        self.instances
            .get_mut(&instance_id)
            .ok_or_else(|| ServiceWorkerError::not_found(format!("instance {}", instance_id)))
    }

    fn ensure_attached(&self, operation: &str) -> Result<()> {
        if self.processes.is_detached() {
            return Err(ServiceWorkerError::abort(operation));
        }
        Ok(())
    }

    /// Drive an instance's start
    pub fn start_instance(
        &mut self,
        instance_id: InstanceId,
        version_id: VersionId,
        script_url: Url,
        hint: Option<ProcessId>,
    ) -> Result<StartDispatch> {
        self.ensure_attached("start worker")?;
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| ServiceWorkerError::not_found(format!("instance {}", instance_id)))?;
        instance.start(&mut self.processes, version_id, script_url, hint)
    }

    /// Report an asynchronous process allocation back to its instance.
    ///
    /// An instance that vanished while the allocation was in flight yields
    /// `Abort`; the caller owns releasing the process.
    pub fn process_allocated(
        &mut self,
        instance_id: InstanceId,
        allocation: Result<ProcessId>,
    ) -> Result<ProcessId> {
        self.ensure_attached("start worker")?;
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            debug!(instance_id = %instance_id, "Allocation finished for removed instance");
            return Err(ServiceWorkerError::abort("start worker"));
        };
        instance.record_started_process(&mut self.processes, allocation)
    }

    /// Dispatch a start message to an already-known process
    pub fn start_worker(
        &mut self,
        process_id: ProcessId,
        instance_id: InstanceId,
        version_id: VersionId,
        script_url: &Url,
    ) -> Result<()> {
        self.processes
            .start_worker(process_id, instance_id, version_id, script_url)
    }

    /// Dispatch a stop message to a process
    pub fn stop_worker(&mut self, process_id: ProcessId, instance_id: InstanceId) -> Result<()> {
        self.processes.stop_worker(process_id, instance_id)
    }

    pub fn stop_instance(&mut self, instance_id: InstanceId) -> Result<()> {
        self.ensure_attached("stop worker")?;
        let instance = self
            .instances
            .get_mut(&instance_id)
            .ok_or_else(|| ServiceWorkerError::not_found(format!("instance {}", instance_id)))?;
        instance.stop(&mut self.processes)
    }

    pub fn send_message(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        message: WorkerMessage,
    ) -> Result<()> {
        self.ensure_attached("send message")?;
        let instance = self
            .instances
            .get(&instance_id)
            .ok_or_else(|| ServiceWorkerError::not_found(format!("instance {}", instance_id)))?;
        instance.send_message(&self.processes, request_id, message)
    }

    /// Inbound start confirmation from a process
    pub fn on_worker_started(
        &mut self,
        process_id: ProcessId,
        thread_id: ThreadId,
        instance_id: InstanceId,
    ) {
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            warn!(instance_id = %instance_id, process_id = %process_id, "Start confirmed for unknown instance");
            return;
        };
        if instance.process_id() != Some(process_id) {
            warn!(
                instance_id = %instance_id,
                process_id = %process_id,
                "Start confirmed by a process that does not host the instance"
            );
            return;
        }
        match instance.on_started(thread_id) {
            Ok(true) => self.processes.mark_active(process_id, instance_id),
            Ok(false) => {}
            Err(err) => warn!(instance_id = %instance_id, error = %err, "Unexpected start confirmation"),
        }
    }

    /// Inbound stop confirmation from a process
    pub fn on_worker_stopped(&mut self, process_id: ProcessId, instance_id: InstanceId) {
        self.processes.mark_inactive(process_id, instance_id);
        let Some(instance) = self.instances.get_mut(&instance_id) else {
            warn!(instance_id = %instance_id, process_id = %process_id, "Stop confirmed for unknown instance");
            return;
        };
        if instance.status() == WorkerStatus::Stopped
            || instance.process_id() != Some(process_id)
        {
            debug!(instance_id = %instance_id, process_id = %process_id, "Ignoring stale stop confirmation");
            return;
        }
        // An unsolicited stop still holds the affinity taken at start.
        self.processes.release_affinity(process_id, instance_id);
        instance.on_stopped();
    }

    /// Route an application message from a worker, filtered by kind
    pub fn on_message_from_worker(
        &self,
        instance_id: InstanceId,
        request_id: RequestId,
        message: WorkerMessage,
    ) -> bool {
        if !self.config.allows(&message.kind) {
            warn!(
                instance_id = %instance_id,
                kind = %message.kind,
                "Dropping disallowed worker message"
            );
            return false;
        }
        let Some(instance) = self.instances.get(&instance_id) else {
            warn!(instance_id = %instance_id, "Message from unknown instance");
            return false;
        };
        instance.on_message(request_id, message);
        true
    }

    pub fn register_process_channel(
        &mut self,
        process_id: ProcessId,
        channel: Arc<dyn ProcessChannel>,
    ) {
        self.processes.register_channel(process_id, channel);
    }

    /// Drop a process channel, forcing every instance it hosted to STOPPED.
    ///
    /// Returns the instances that were stopped.
    pub fn remove_process_channel(&mut self, process_id: ProcessId) -> Vec<InstanceId> {
        if !self.processes.remove_channel(process_id) {
            debug!(process_id = %process_id, "Removing unknown process channel");
        }
        let mut stopped = Vec::new();
        for (instance_id, instance) in self.instances.iter_mut() {
            if instance.process_id() == Some(process_id)
                && instance.status() != WorkerStatus::Stopped
            {
                instance.on_stopped();
                stopped.push(*instance_id);
            }
        }
        if !stopped.is_empty() {
            info!(process_id = %process_id, count = stopped.len(), "Process gone, workers stopped");
        }
        stopped
    }

    pub fn add_process_reference(
        &mut self,
        instance_id: InstanceId,
        process_id: ProcessId,
    ) -> Result<()> {
        self.instance_mut(instance_id)?.add_process_reference(process_id);
        Ok(())
    }

    pub fn release_process_reference(
        &mut self,
        instance_id: InstanceId,
        process_id: ProcessId,
    ) -> Result<()> {
        self.instance_mut(instance_id)?.release_process_reference(process_id);
        Ok(())
    }

    pub fn select_process(&self) -> Option<ProcessId> {
        self.processes.select_process()
    }

    pub fn process_affinity(&self, process_id: ProcessId) -> usize {
        self.processes.affinity(process_id)
    }

    pub fn has_process(&self, process_id: ProcessId) -> bool {
        self.processes.contains(process_id)
    }

    pub fn active_workers(&self, process_id: ProcessId) -> Vec<InstanceId> {
        self.processes.active_workers(process_id)
    }

    /// Stop every live worker and refuse further dispatches
    pub fn shutdown(&mut self) {
        for (instance_id, instance) in self.instances.iter_mut() {
            if matches!(
                instance.status(),
                WorkerStatus::Starting | WorkerStatus::Running
            ) && instance.process_id().is_some()
            {
                if let Err(err) = instance.stop(&mut self.processes) {
                    warn!(instance_id = %instance_id, error = %err, "Stop during shutdown failed");
                }
            }
        }
        self.processes.detach();
        info!(instances = self.instances.len(), "Worker registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.processes.is_detached()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::events::WorkerEvent;
    use crate::worker::messages::{ControlMessage, MessageKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn script() -> Url {
        Url::parse("https://example.test/sw.js").unwrap()
    }

    fn registry_with_process(
        process_id: ProcessId,
    ) -> (WorkerRegistry, mpsc::UnboundedReceiver<ControlMessage>) {
        let mut registry = WorkerRegistry::new(&ContextConfig::default(), EventBus::new(32));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register_process_channel(process_id, Arc::new(tx));
        (registry, rx)
    }

    fn start_running(
        registry: &mut WorkerRegistry,
        process_id: ProcessId,
        thread: i32,
    ) -> InstanceId {
        let id = registry.create_instance();
        registry
            .start_instance(id, VersionId(1), script(), Some(process_id))
            .unwrap();
        registry.on_worker_started(process_id, ThreadId(thread), id);
        id
    }

    #[test]
    fn instance_ids_are_never_reused() {
        let mut registry = WorkerRegistry::new(&ContextConfig::default(), EventBus::new(4));
        let first = registry.create_instance();
        assert!(registry.remove_instance(first));
        let second = registry.create_instance();
        assert!(second > first);
        assert!(!registry.remove_instance(first));
    }

    #[test]
    fn removing_channel_stops_hosted_instances_once() {
        let (mut registry, _rx) = registry_with_process(ProcessId(7));
        let bus_rx_source = registry.bus.clone();
        let mut events = bus_rx_source.subscribe();

        let running = start_running(&mut registry, ProcessId(7), 1);
        let starting = registry.create_instance();
        registry
            .start_instance(starting, VersionId(2), script(), Some(ProcessId(7)))
            .unwrap();
        let idle = registry.create_instance();

        let stopped = registry.remove_process_channel(ProcessId(7));
        assert_eq!(stopped, vec![running, starting]);
        assert!(!registry.has_process(ProcessId(7)));
        assert_eq!(registry.instance_info(idle).unwrap().status, WorkerStatus::Stopped);

        // A late confirmation from the dead process changes nothing.
        registry.on_worker_stopped(ProcessId(7), running);

        let mut stops = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            if let WorkerEvent::Stopped { instance_id } = envelope.event {
                stops.push(instance_id);
            }
        }
        assert_eq!(stops, vec![running, starting]);
    }

    #[test]
    fn confirmations_for_unknown_instances_are_ignored() {
        let (mut registry, _rx) = registry_with_process(ProcessId(1));
        registry.on_worker_started(ProcessId(1), ThreadId(1), InstanceId(42));
        registry.on_worker_stopped(ProcessId(1), InstanceId(42));
        assert!(registry.active_workers(ProcessId(1)).is_empty());
    }

    #[test]
    fn messages_outside_the_allow_list_are_dropped() {
        let (mut registry, _rx) = registry_with_process(ProcessId(1));
        let id = start_running(&mut registry, ProcessId(1), 3);
        let mut events = registry.subscribe_instance(id).unwrap();

        let allowed = WorkerMessage::new(MessageKind::FetchEventFinished, json!({"status": 200}));
        let denied = WorkerMessage::new(MessageKind::Other("navigate".into()), json!({}));
        assert!(registry.on_message_from_worker(id, RequestId(1), allowed.clone()));
        assert!(!registry.on_message_from_worker(id, RequestId(2), denied));

        let envelope = events.try_recv().unwrap();
        assert_eq!(
            envelope.event,
            WorkerEvent::MessageReceived {
                instance_id: id,
                request_id: RequestId(1),
                message: allowed,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn active_set_tracks_confirmations() {
        let (mut registry, mut rx) = registry_with_process(ProcessId(1));
        let id = start_running(&mut registry, ProcessId(1), 3);
        assert_eq!(registry.active_workers(ProcessId(1)), vec![id]);

        registry
            .send_message(id, RequestId(9), WorkerMessage::new(MessageKind::Test, json!("ping")))
            .unwrap();
        registry.stop_instance(id).unwrap();
        registry.on_worker_stopped(ProcessId(1), id);
        assert!(registry.active_workers(ProcessId(1)).is_empty());
        assert_eq!(registry.process_affinity(ProcessId(1)), 0);

        let sent: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(sent.len(), 3);
        assert!(matches!(sent[1], ControlMessage::SendMessageToWorker { request_id: RequestId(9), .. }));
    }

    #[test]
    fn shutdown_stops_workers_and_aborts_dispatch() {
        let (mut registry, _rx) = registry_with_process(ProcessId(1));
        let id = start_running(&mut registry, ProcessId(1), 3);

        registry.shutdown();
        assert!(registry.is_shut_down());
        assert_eq!(registry.instance_info(id).unwrap().status, WorkerStatus::Stopping);
        let other = registry.create_instance();
        assert!(matches!(
            registry.start_instance(other, VersionId(2), script(), Some(ProcessId(1))),
            Err(ServiceWorkerError::Abort { .. })
        ));
    }

    #[test]
    fn allocation_for_removed_instance_aborts() {
        let mut registry = WorkerRegistry::new(&ContextConfig::default(), EventBus::new(4));
        let id = registry.create_instance();
        assert_eq!(
            registry.start_instance(id, VersionId(1), script(), None).unwrap(),
            StartDispatch::NeedsProcess
        );
        registry.remove_instance(id);
        assert!(matches!(
            registry.process_allocated(id, Ok(ProcessId(3))),
            Err(ServiceWorkerError::Abort { .. })
        ));
    }
}

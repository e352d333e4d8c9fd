//! Process reference table
//!
//! Maps each host process to its outbound channel and to the instances
//! affined to it. Owned and mutated only by the [`WorkerRegistry`].
//!
//! [`WorkerRegistry`]: crate::worker::registry::WorkerRegistry

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{InstanceId, ProcessId, VersionId};
use crate::worker::messages::ControlMessage;

/// Outbound message channel to one host process
///
/// Sending is fire-and-forget; a rejected message is handed back to the caller.
pub trait ProcessChannel: Send + Sync {
    fn send(&self, message: ControlMessage) -> std::result::Result<(), ControlMessage>;
}

impl ProcessChannel for mpsc::UnboundedSender<ControlMessage> {
    fn send(&self, message: ControlMessage) -> std::result::Result<(), ControlMessage> {
        mpsc::UnboundedSender::send(self, message).map_err(|e| e.0)
    }
}

impl ProcessChannel for mpsc::Sender<ControlMessage> {
    fn send(&self, message: ControlMessage) -> std::result::Result<(), ControlMessage> {
        self.try_send(message).map_err(|e| e.into_inner())
    }
}

struct ProcessEntry {
    channel: Arc<dyn ProcessChannel>,
    /// Instances a start was dispatched to and not yet stopped
    affined: BTreeSet<InstanceId>,
    /// Instances whose start the process confirmed
    active: BTreeSet<InstanceId>,
}

/// Per-registry table of host processes
#[derive(Default)]
pub struct ProcessTable {
    entries: BTreeMap<ProcessId, ProcessEntry>,
    detached: bool,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the channel for a process
    pub fn register_channel(&mut self, process_id: ProcessId, channel: Arc<dyn ProcessChannel>) {
        match self.entries.get_mut(&process_id) {
            Some(entry) => {
                if !entry.affined.is_empty() || !entry.active.is_empty() {
                    warn!(process_id = %process_id, "Replacing channel of a process that still hosts workers");
                }
                entry.channel = channel;
            }
            None => {
                self.entries.insert(
                    process_id,
                    ProcessEntry {
                        channel,
                        affined: BTreeSet::new(),
                        active: BTreeSet::new(),
                    },
                );
            }
        }
        debug!(process_id = %process_id, "Registered process channel");
    }

    /// Drop a process entry, returning whether it existed
    pub fn remove_channel(&mut self, process_id: ProcessId) -> bool {
        self.entries.remove(&process_id).is_some()
    }

    pub fn contains(&self, process_id: ProcessId) -> bool {
        self.entries.contains_key(&process_id)
    }

    /// Number of instances currently affined to a process
    pub fn affinity(&self, process_id: ProcessId) -> usize {
        self.entries
            .get(&process_id)
            .map(|entry| entry.affined.len())
            .unwrap_or(0)
    }

    /// Instances whose start the process confirmed
    pub fn active_workers(&self, process_id: ProcessId) -> Vec<InstanceId> {
        self.entries
            .get(&process_id)
            .map(|entry| entry.active.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pick the hosting process with the highest affinity count.
    ///
    /// Processes with no affined instance are not candidates. Ties go to the
    /// lowest process id.
    pub fn select_process(&self) -> Option<ProcessId> {
        let mut best: Option<(ProcessId, usize)> = None;
        for (process_id, entry) in &self.entries {
            let count = entry.affined.len();
            if count == 0 {
                continue;
            }
            match best {
                Some((_, best_count)) if best_count >= count => {}
                _ => best = Some((*process_id, count)),
            }
        }
        best.map(|(process_id, _)| process_id)
    }

    /// Refuse every further dispatch with an abort status
    pub fn detach(&mut self) {
        self.detached = true;
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Send a control message to a process
    pub fn send(&self, process_id: ProcessId, message: ControlMessage) -> Result<()> {
        if self.detached {
            return Err(ServiceWorkerError::abort("send to process"));
        }
        let entry = self
            .entries
            .get(&process_id)
            .ok_or(ServiceWorkerError::ProcessNotFound { process_id })?;
        entry
            .channel
            .send(message)
            .map_err(|_| ServiceWorkerError::IpcFailed { process_id })
    }

    /// Dispatch a start message, counting the instance's affinity first
    pub fn start_worker(
        &mut self,
        process_id: ProcessId,
        instance_id: InstanceId,
        version_id: VersionId,
        script_url: &Url,
    ) -> Result<()> {
        if self.detached {
            return Err(ServiceWorkerError::abort("start worker"));
        }
        let entry = self
            .entries
            .get_mut(&process_id)
            .ok_or(ServiceWorkerError::ProcessNotFound { process_id })?;
        let newly_affined = entry.affined.insert(instance_id);

        let message = ControlMessage::StartWorker {
            instance_id,
            version_id,
            script_url: script_url.clone(),
        };
        if entry.channel.send(message).is_err() {
            if newly_affined {
                entry.affined.remove(&instance_id);
            }
            return Err(ServiceWorkerError::IpcFailed { process_id });
        }
        Ok(())
    }

    /// Dispatch a stop message; the affinity is released once the send succeeds
    pub fn stop_worker(&mut self, process_id: ProcessId, instance_id: InstanceId) -> Result<()> {
        self.send(process_id, ControlMessage::StopWorker { instance_id })?;
        self.release_affinity(process_id, instance_id);
        Ok(())
    }

    pub fn release_affinity(&mut self, process_id: ProcessId, instance_id: InstanceId) {
        if let Some(entry) = self.entries.get_mut(&process_id) {
            entry.affined.remove(&instance_id);
        }
    }

    pub fn mark_active(&mut self, process_id: ProcessId, instance_id: InstanceId) {
        if let Some(entry) = self.entries.get_mut(&process_id) {
            entry.active.insert(instance_id);
        }
    }

    pub fn mark_inactive(&mut self, process_id: ProcessId, instance_id: InstanceId) {
        if let Some(entry) = self.entries.get_mut(&process_id) {
            entry.active.remove(&instance_id);
        }
    }

    /// Forget every reference to an instance
    pub fn forget_instance(&mut self, instance_id: InstanceId) {
        for entry in self.entries.values_mut() {
            entry.affined.remove(&instance_id);
            entry.active.remove(&instance_id);
        }
    }
}

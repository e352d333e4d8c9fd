//! Per-scope job queues
//!
//! Exactly one job per scope runs at a time. A request equal to the last queued
//! job for its scope attaches to it and shares its result; anything else waits
//! behind it.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{JobRequest, PendingStart};
use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{JobId, ProcessId};
use crate::storage::Registration;

pub type JobResult = Result<Registration>;
pub type JobWaiter = oneshot::Sender<JobResult>;

struct QueuedJob {
    id: JobId,
    request: JobRequest,
    waiters: Vec<JobWaiter>,
    start: Arc<Mutex<PendingStart>>,
}

/// A job that has reached the head of its queue and must be run now
#[derive(Debug)]
pub struct ReadyJob {
    pub id: JobId,
    pub request: JobRequest,
    pub start: Arc<Mutex<PendingStart>>,
}

#[derive(Debug, Default)]
pub struct Enqueued {
    pub job_id: Option<JobId>,
    /// Set when the request created a new job at the head of its queue
    pub ready: Option<ReadyJob>,
    /// A caller's process hint that will not be used and must be released
    pub released_hint: Option<ProcessId>,
}

#[derive(Debug, Default)]
pub struct Finished {
    pub next: Option<ReadyJob>,
    pub released_hint: Option<ProcessId>,
}

#[derive(Default)]
pub struct JobCoordinator {
    queues: HashMap<String, VecDeque<QueuedJob>>,
    next_job_id: u64,
}

impl JobCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to an equal pending job or queue a new one
    pub fn enqueue(
        &mut self,
        request: JobRequest,
        hint: Option<ProcessId>,
        waiter: JobWaiter,
    ) -> Enqueued {
        let queue = self
            .queues
            .entry(request.scope.as_str().to_string())
            .or_default();

        if let Some(last) = queue.back_mut() {
            if last.request == request {
                debug!(job_id = %last.id, scope = %request.scope, "Attaching to pending job");
                last.waiters.push(waiter);
                let released_hint = last.start.lock().offer(hint);
                return Enqueued {
                    job_id: Some(last.id),
                    ready: None,
                    released_hint,
                };
            }
        }

        self.next_job_id += 1;
        let id = JobId(self.next_job_id);
        let mut pending = PendingStart::default();
        let released_hint = pending.offer(hint);
        let start = Arc::new(Mutex::new(pending));
        let is_head = queue.is_empty();
        queue.push_back(QueuedJob {
            id,
            request: request.clone(),
            waiters: vec![waiter],
            start: start.clone(),
        });
        debug!(job_id = %id, scope = %request.scope, queued = !is_head, "Created job");

        Enqueued {
            job_id: Some(id),
            ready: is_head.then_some(ReadyJob { id, request, start }),
            released_hint,
        }
    }

    /// Fan a finished job's result out and hand back the next job for its scope
    pub fn finish(&mut self, scope: &str, job_id: JobId, result: JobResult) -> Finished {
        let Some(queue) = self.queues.get_mut(scope) else {
            warn!(job_id = %job_id, scope, "Finished job has no queue");
            return Finished::default();
        };
        if queue.front().map(|job| job.id) != Some(job_id) {
            warn!(job_id = %job_id, scope, "Finished job is not at the head of its queue");
            return Finished::default();
        }
        let Some(job) = queue.pop_front() else {
            return Finished::default();
        };

        for waiter in job.waiters {
            // A dropped receiver means the caller stopped waiting.
            let _ = waiter.send(result.clone());
        }
        let released_hint = job.start.lock().unused_hint();

        let next = queue.front().map(|job| ReadyJob {
            id: job.id,
            request: job.request.clone(),
            start: job.start.clone(),
        });
        if queue.is_empty() {
            self.queues.remove(scope);
        }
        Finished {
            next,
            released_hint,
        }
    }

    /// Fail every pending job with `Abort`, returning hints to release
    pub fn abort_all(&mut self) -> Vec<ProcessId> {
        let mut hints = Vec::new();
        for (_, queue) in self.queues.drain() {
            for job in queue {
                for waiter in job.waiters {
                    let _ = waiter.send(Err(ServiceWorkerError::abort("job")));
                }
                hints.extend(job.start.lock().unused_hint());
            }
        }
        hints
    }

    pub fn pending_jobs(&self, scope: &str) -> usize {
        self.queues.get(scope).map(VecDeque::len).unwrap_or(0)
    }
}

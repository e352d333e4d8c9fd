//! Registration jobs
//!
//! Every scope-level operation (register, update, unregister) is a job. Jobs
//! are queued per scope by the [`JobCoordinator`] and run as spawned tasks that
//! talk to the durable store directly and to the worker registry through the
//! context handle.

pub mod coordinator;
pub mod register_job;
pub mod unregister_job;
pub mod update_job;

pub use coordinator::{JobCoordinator, JobResult, ReadyJob};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::context::ServiceWorkerContext;
use crate::core::errors::Result;
use crate::core::ids::{ProcessId, ScriptId, VersionId};
use crate::script_cache::ScriptCacheWriter;
use crate::storage::{Registration, RegistrationStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Register { script_url: Url },
    Update { force: bool },
    Unregister,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { .. } => write!(f, "register"),
            Self::Update { .. } => write!(f, "update"),
            Self::Unregister => write!(f, "unregister"),
        }
    }
}

/// Two requests are equal when they would do the same work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub scope: Url,
    pub kind: JobKind,
}

/// Process hint handed from attached callers to the job's eventual start.
///
/// The first hint offered before a version exists is kept; every other hint
/// is returned so the caller's process can be released.
#[derive(Debug, Default)]
pub struct PendingStart {
    version_created: bool,
    hint: Option<ProcessId>,
}

impl PendingStart {
    /// Offer a hint, returning it back when it will not be used
    pub fn offer(&mut self, hint: Option<ProcessId>) -> Option<ProcessId> {
        let hint = hint?;
        if self.version_created || self.hint.is_some() {
            Some(hint)
        } else {
            self.hint = Some(hint);
            None
        }
    }

    /// Claim the retained hint for the version being created
    pub fn take_for_start(&mut self) -> Option<ProcessId> {
        self.version_created = true;
        self.hint.take()
    }

    /// A hint that never reached a start
    pub fn unused_hint(&mut self) -> Option<ProcessId> {
        self.hint.take()
    }
}

/// Everything a running job needs
#[derive(Clone)]
pub struct JobContext {
    pub context: ServiceWorkerContext,
    pub store: Arc<dyn RegistrationStore>,
    pub scripts: Arc<dyn ScriptCacheWriter>,
    pub start: Arc<parking_lot::Mutex<PendingStart>>,
    pub update_check_interval: Duration,
}

impl JobContext {
    /// Allocate a version for `registration` and start its worker.
    ///
    /// The version is ACTIVE as soon as the hosting process accepted the start
    /// message.
    pub(crate) async fn start_new_version(
        &self,
        registration: &Registration,
        script_id: ScriptId,
    ) -> Result<VersionId> {
        let version_id = self.store.new_version_id().await?;
        let hint = self.start.lock().take_for_start();
        self.context
            .start_new_version(
                version_id,
                registration.id,
                registration.script_url.clone(),
                script_id,
                hint,
            )
            .await?;
        Ok(version_id)
    }
}

/// Run one job to completion
pub(crate) async fn run(ctx: &JobContext, request: &JobRequest) -> JobResult {
    match &request.kind {
        JobKind::Register { script_url } => {
            register_job::run(ctx, request.scope.clone(), script_url.clone()).await
        }
        JobKind::Update { force } => update_job::run(ctx, request.scope.clone(), *force).await,
        JobKind::Unregister => unregister_job::run(ctx, request.scope.clone()).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_is_rejected_once_version_exists() {
        let mut pending = PendingStart::default();
        assert_eq!(pending.offer(None), None);
        assert_eq!(pending.take_for_start(), None);
        assert_eq!(pending.offer(Some(ProcessId(3))), Some(ProcessId(3)));
        assert_eq!(pending.unused_hint(), None);
    }
}

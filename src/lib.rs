//! Registration and runtime lifecycle of background worker scripts hosted in
//! separate processes.
//!
//! A [`ServiceWorkerContext`] deduplicates concurrent registrations per scope,
//! drives each worker through its start/stop state machine and routes
//! messages to whichever process currently hosts it.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod ids;
}

pub mod context;
pub mod job;
pub mod process;
pub mod script_cache;
pub mod storage;
pub mod version;
pub mod worker;

// Re-exports for convenience
pub use crate::core::config::{ContextConfig, ContextConfigBuilder};
pub use crate::core::errors::{Result, ServiceWorkerError};
pub use crate::core::ids::{
    InstanceId, JobId, ProcessId, RegistrationId, RequestId, ScriptId, ThreadId, VersionId,
};
pub use context::{ContextBuilder, ServiceWorkerContext};
pub use process::ProcessProvider;
pub use script_cache::{FetchOutcome, InMemoryScriptCache, ScriptCacheWriter};
pub use storage::{MemoryRegistrationStore, Registration, RegistrationStore, SledRegistrationStore};
pub use version::{ServiceWorkerVersion, VersionStatus};
pub use worker::{
    ControlMessage, EventEnvelope, InstanceInfo, MessageKind, ProcessChannel, WorkerEvent,
    WorkerMessage, WorkerStatus,
};

use thiserror::Error;

use super::ids::{InstanceId, ProcessId};

/// Unified error type for the service worker core
///
/// Every asynchronous boundary reports one of these instead of panicking.
/// The type is `Clone` so a single job result can be fanned out to every
/// caller attached to that job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceWorkerError {
    /// No registration, version or instance matched the request
    #[error("Not found: {what}")]
    NotFound { what: String },

    /// The target process has no registered message channel
    #[error("Process not found: {process_id}")]
    ProcessNotFound { process_id: ProcessId },

    /// Sending a control message to a process failed
    #[error("IPC send to process {process_id} failed")]
    IpcFailed { process_id: ProcessId },

    /// The owning context shut down mid-operation
    #[error("Operation aborted: {operation}")]
    Abort { operation: String },

    /// The process provider could not supply a host process
    #[error("Failed to start worker: {reason}")]
    StartWorkerFailed { reason: String },

    /// Durable store operation failed
    #[error("Store operation failed: {operation} - {message}")]
    Store { operation: String, message: String },

    /// An update produced byte-identical script content
    #[error("Script unchanged: {script_url}")]
    ScriptUnchanged { script_url: String },

    /// Fetching the script from the network failed
    #[error("Network error fetching {script_url}: {message}")]
    Network { script_url: String, message: String },

    /// Writing the fetched script to the script cache failed
    #[error("Script cache write failed for {script_url}: {message}")]
    CacheWrite { script_url: String, message: String },

    /// The worker must be running for this operation
    #[error("Worker {instance_id} is not running")]
    NotRunning { instance_id: InstanceId },

    /// A state machine precondition was violated
    #[error("Cannot {operation} while {state}")]
    InvalidState { operation: String, state: String },

    /// Scope and script URL are not usable together
    #[error("Invalid scope {scope}: {reason}")]
    InvalidScope { scope: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

impl ServiceWorkerError {
    /// Create a not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an abort error for an operation interrupted by shutdown
    pub fn abort<S: Into<String>>(operation: S) -> Self {
        Self::Abort {
            operation: operation.into(),
        }
    }

    /// Create a store error from any displayable source
    pub fn store<S: Into<String>, E: std::fmt::Display>(operation: S, source: E) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
        }
    }

    /// Create an invalid-state error
    pub fn invalid_state<O: Into<String>, S: std::fmt::Display>(operation: O, state: S) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::ProcessNotFound { .. } => "process_not_found",
            Self::IpcFailed { .. } => "ipc_failure",
            Self::Abort { .. } => "aborted",
            Self::StartWorkerFailed { .. } => "start_worker_failed",
            Self::Store { .. } => "store_error",
            Self::ScriptUnchanged { .. } => "script_unchanged",
            Self::Network { .. } => "network",
            Self::CacheWrite { .. } => "cache_write",
            Self::NotRunning { .. } => "not_running",
            Self::InvalidState { .. } => "invalid_state",
            Self::InvalidScope { .. } => "invalid_scope",
            Self::Configuration { .. } => "configuration",
        }
    }

    /// Whether a caller may reasonably retry the same operation.
    ///
    /// The core itself never retries; this only informs the embedder.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IpcFailed { .. }
                | Self::ProcessNotFound { .. }
                | Self::StartWorkerFailed { .. }
                | Self::Store { .. }
                | Self::Network { .. }
                | Self::CacheWrite { .. }
        )
    }
}

impl From<sled::Error> for ServiceWorkerError {
    fn from(err: sled::Error) -> Self {
        Self::store("sled_operation", err)
    }
}

impl From<serde_json::Error> for ServiceWorkerError {
    fn from(err: serde_json::Error) -> Self {
        Self::store("json_encoding", err)
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(ServiceWorkerError::not_found("scope").category(), "not_found");
        assert_eq!(
            ServiceWorkerError::IpcFailed {
                process_id: ProcessId(1)
            }
            .category(),
            "ipc_failure"
        );
        assert_eq!(
            ServiceWorkerError::ScriptUnchanged {
                script_url: "https://a.test/sw.js".into()
            }
            .category(),
            "script_unchanged"
        );
    }

    #[test]
    fn test_error_retryability() {
        assert!(ServiceWorkerError::store("save", "disk full").is_retryable());
        assert!(!ServiceWorkerError::abort("start").is_retryable());
        assert!(!ServiceWorkerError::ScriptUnchanged {
            script_url: "https://a.test/sw.js".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ServiceWorkerError::invalid_state("stop", "stopped");
        assert_eq!(err.to_string(), "Cannot stop while stopped");

        let err = ServiceWorkerError::configuration_field("must be positive", "event_capacity");
        assert!(matches!(
            err,
            ServiceWorkerError::Configuration { field: Some(ref f), .. } if f == "event_capacity"
        ));
    }
}

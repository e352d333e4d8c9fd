//! Control and application messages exchanged with host processes
//!
//! The encoding on the wire is up to the transport; these types only fix the
//! shape of what crosses the process boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use url::Url;

use crate::core::ids::{InstanceId, RequestId, ThreadId, VersionId};

/// Kinds of application message a worker may send back to the context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    InstallEventFinished,
    ActivateEventFinished,
    FetchEventFinished,
    SyncEventFinished,
    /// Messages used by test harnesses
    Test,
    /// Anything else; never allowed through the inbound route
    Other(String),
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InstallEventFinished => write!(f, "install_event_finished"),
            Self::ActivateEventFinished => write!(f, "activate_event_finished"),
            Self::FetchEventFinished => write!(f, "fetch_event_finished"),
            Self::SyncEventFinished => write!(f, "sync_event_finished"),
            Self::Test => write!(f, "test"),
            Self::Other(kind) => write!(f, "other({})", kind),
        }
    }
}

/// An application-level message to or from a running worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub kind: MessageKind,
    pub payload: Value,
}

impl WorkerMessage {
    /// Create a message of the given kind
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

/// Control messages sent from the context to a host process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    StartWorker {
        instance_id: InstanceId,
        version_id: VersionId,
        script_url: Url,
    },
    StopWorker {
        instance_id: InstanceId,
    },
    SendMessageToWorker {
        thread_id: ThreadId,
        instance_id: InstanceId,
        request_id: RequestId,
        message: WorkerMessage,
    },
}

impl ControlMessage {
    /// Instance the message is addressed to
    pub fn instance_id(&self) -> InstanceId {
        match self {
            Self::StartWorker { instance_id, .. }
            | Self::StopWorker { instance_id }
            | Self::SendMessageToWorker { instance_id, .. } => *instance_id,
        }
    }
}

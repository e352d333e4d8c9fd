//! Strongly typed identifiers shared by the registry, jobs and store.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Raw value of the identifier
            pub fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Identifier of a host process
    ProcessId(i32)
);
id_type!(
    /// Identifier of a worker instance; allocated once by the registry and never reused
    InstanceId(u64)
);
id_type!(
    /// Execution context (thread) hosting a running worker inside its process
    ThreadId(i32)
);
id_type!(
    /// Correlates an application message with its reply
    RequestId(i32)
);
id_type!(
    /// Registration identifier allocated by the durable store
    RegistrationId(i64)
);
id_type!(
    /// Worker version identifier allocated by the durable store
    VersionId(i64)
);
id_type!(
    /// Identifier of a cached script body
    ScriptId(i64)
);
id_type!(
    /// Identifier of a queued or running job
    JobId(u64)
);

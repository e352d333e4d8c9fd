//! Worker runtime: instances, their host processes and the registry that
//! routes between them.

pub mod events;
pub mod instance;
pub mod messages;
pub mod process_table;
pub mod registry;

pub use events::{EventBus, EventEnvelope, WorkerEvent};
pub use instance::{InstanceInfo, StartDispatch, WorkerInstance, WorkerStatus};
pub use messages::{ControlMessage, MessageKind, WorkerMessage};
pub use process_table::{ProcessChannel, ProcessTable};
pub use registry::WorkerRegistry;

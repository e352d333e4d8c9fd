//! Process provider collaborator
//!
//! Creating and tearing down host processes is the embedder's business. The
//! context only asks for a process to host a script and hands back processes
//! it ended up not using.

use async_trait::async_trait;
use url::Url;

use crate::core::errors::Result;
use crate::core::ids::ProcessId;

#[async_trait]
pub trait ProcessProvider: Send + Sync {
    /// Select an existing process or create one for `script_url`.
    ///
    /// The provider must have registered the process's channel with the
    /// context before returning its id.
    async fn select_or_create_process(
        &self,
        script_url: &Url,
        hint: Option<ProcessId>,
    ) -> Result<ProcessId>;

    /// A process hint offered by a caller was not used
    async fn release_hint(&self, _process_id: ProcessId) {}

    /// A process allocated for a start was not used
    async fn release_process(&self, _process_id: ProcessId) {}
}

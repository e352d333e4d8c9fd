//! Durable registration storage
//!
//! The coordination logic only needs lookup, save and delete by scope plus id
//! allocation. [`MemoryRegistrationStore`] serves tests and embedders without
//! persistence; [`SledRegistrationStore`] keeps records on disk.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryRegistrationStore;
pub use sled_store::SledRegistrationStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::errors::Result;
use crate::core::ids::{RegistrationId, ScriptId, VersionId};

/// Durable record binding a scope to a script URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: RegistrationId,
    pub scope: Url,
    pub script_url: Url,
    pub active_version: Option<VersionId>,
    /// Cached script body of the active version
    #[serde(default)]
    pub script_id: Option<ScriptId>,
    pub last_update_check: DateTime<Utc>,
}

impl Registration {
    pub fn new(id: RegistrationId, scope: Url, script_url: Url) -> Self {
        Self {
            id,
            scope,
            script_url,
            active_version: None,
            script_id: None,
            last_update_check: Utc::now(),
        }
    }
}

/// Storage collaborator used by registration jobs
///
/// Implementations must be safe to call concurrently for different scopes.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    /// Look up the registration for a scope
    async fn find_registration(&self, scope: &Url) -> Result<Option<Registration>>;

    /// Insert or replace the registration for its scope
    async fn store_registration(&self, registration: &Registration) -> Result<()>;

    /// Delete the registration for a scope; deleting a missing scope is a no-op
    async fn delete_registration(&self, scope: &Url) -> Result<()>;

    async fn new_registration_id(&self) -> Result<RegistrationId>;

    async fn new_version_id(&self) -> Result<VersionId>;
}

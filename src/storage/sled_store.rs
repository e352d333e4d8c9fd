use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use tracing::debug;
use url::Url;

use super::{Registration, RegistrationStore};
use crate::core::errors::Result;
use crate::core::ids::{RegistrationId, VersionId};

const REGISTRATIONS_TREE: &str = "sw_registrations";

/// Registration store persisted in a sled database.
///
/// Records are serde_json documents keyed by scope URL. Ids come from
/// [`sled::Db::generate_id`], so they stay unique across restarts.
#[derive(Clone)]
pub struct SledRegistrationStore {
    db: Db,
    registrations: Tree,
}

impl SledRegistrationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    pub fn from_db(db: Db) -> Result<Self> {
        let registrations = db.open_tree(REGISTRATIONS_TREE)?;
        Ok(Self { db, registrations })
    }

    pub fn flush(&self) -> Result<()> {
        self.registrations.flush()?;
        Ok(())
    }

    fn next_id(&self) -> Result<i64> {
        // generate_id starts at 0; keep 0 free as "unset".
        Ok(self.db.generate_id()? as i64 + 1)
    }
}

#[async_trait]
impl RegistrationStore for SledRegistrationStore {
    async fn find_registration(&self, scope: &Url) -> Result<Option<Registration>> {
        match self.registrations.get(scope.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn store_registration(&self, registration: &Registration) -> Result<()> {
        let bytes = serde_json::to_vec(registration)?;
        self.registrations
            .insert(registration.scope.as_str().as_bytes(), bytes)?;
        debug!(scope = %registration.scope, registration_id = %registration.id, "Stored registration");
        Ok(())
    }

    async fn delete_registration(&self, scope: &Url) -> Result<()> {
        self.registrations.remove(scope.as_str().as_bytes())?;
        Ok(())
    }

    async fn new_registration_id(&self) -> Result<RegistrationId> {
        Ok(RegistrationId(self.next_id()?))
    }

    async fn new_version_id(&self) -> Result<VersionId> {
        Ok(VersionId(self.next_id()?))
    }
}

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use url::Url;

use super::{Registration, RegistrationStore};
use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::{RegistrationId, VersionId};

/// In-memory registration store
///
/// `fail_next` arms a one-shot failure for the next store operation.
#[derive(Debug, Default)]
pub struct MemoryRegistrationStore {
    registrations: DashMap<String, Registration>,
    next_registration_id: AtomicI64,
    next_version_id: AtomicI64,
    injected_failure: Mutex<Option<String>>,
}

impl MemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next operation fail with a store error
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.injected_failure.lock() = Some(message.into());
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Snapshot of a stored record without going through the async trait
    pub fn get(&self, scope: &Url) -> Option<Registration> {
        self.registrations.get(scope.as_str()).map(|r| r.clone())
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        match self.injected_failure.lock().take() {
            Some(message) => Err(ServiceWorkerError::store(operation, message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn find_registration(&self, scope: &Url) -> Result<Option<Registration>> {
        self.check_failure("find_registration")?;
        Ok(self.get(scope))
    }

    async fn store_registration(&self, registration: &Registration) -> Result<()> {
        self.check_failure("store_registration")?;
        self.registrations
            .insert(registration.scope.as_str().to_string(), registration.clone());
        Ok(())
    }

    async fn delete_registration(&self, scope: &Url) -> Result<()> {
        self.check_failure("delete_registration")?;
        self.registrations.remove(scope.as_str());
        Ok(())
    }

    async fn new_registration_id(&self) -> Result<RegistrationId> {
        self.check_failure("new_registration_id")?;
        Ok(RegistrationId(
            self.next_registration_id.fetch_add(1, Ordering::SeqCst) + 1,
        ))
    }

    async fn new_version_id(&self) -> Result<VersionId> {
        self.check_failure("new_version_id")?;
        Ok(VersionId(self.next_version_id.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

//! Worker versions
//!
//! A version is one instantiation of a script for a registration. The table is
//! owned by the context core alongside the worker registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use url::Url;

use crate::core::ids::{InstanceId, RegistrationId, ScriptId, VersionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    New,
    Active,
    /// Superseded or unregistered; its worker is being torn down
    Redundant,
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Active => write!(f, "active"),
            Self::Redundant => write!(f, "redundant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceWorkerVersion {
    pub id: VersionId,
    pub registration_id: RegistrationId,
    pub script_url: Url,
    pub status: VersionStatus,
    pub instance_id: InstanceId,
    pub script_id: Option<ScriptId>,
}

#[derive(Debug, Default)]
pub struct VersionTable {
    versions: HashMap<VersionId, ServiceWorkerVersion>,
    by_instance: HashMap<InstanceId, VersionId>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, version: ServiceWorkerVersion) {
        self.by_instance.insert(version.instance_id, version.id);
        self.versions.insert(version.id, version);
    }

    pub fn get(&self, id: VersionId) -> Option<&ServiceWorkerVersion> {
        self.versions.get(&id)
    }

    pub fn get_mut(&mut self, id: VersionId) -> Option<&mut ServiceWorkerVersion> {
        self.versions.get_mut(&id)
    }

    pub fn remove(&mut self, id: VersionId) -> Option<ServiceWorkerVersion> {
        let version = self.versions.remove(&id)?;
        self.by_instance.remove(&version.instance_id);
        Some(version)
    }

    /// Version hosted by an instance
    pub fn for_instance(&self, instance_id: InstanceId) -> Option<VersionId> {
        self.by_instance.get(&instance_id).copied()
    }

    /// Versions of a registration that are not yet redundant
    pub fn live_for_registration(&self, registration_id: RegistrationId) -> Vec<VersionId> {
        let mut ids: Vec<_> = self
            .versions
            .values()
            .filter(|v| {
                v.registration_id == registration_id && v.status != VersionStatus::Redundant
            })
            .map(|v| v.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

//! Script fetch and cache collaborator
//!
//! Jobs fetch the worker script before starting a new version and compare it
//! against the incumbent version's cached body.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use url::Url;

use crate::core::errors::{Result, ServiceWorkerError};
use crate::core::ids::ScriptId;

/// What happened when a script was fetched and written to the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// No incumbent existed; the body was cached under a new id
    WrittenAsNew { script_id: ScriptId },
    /// The body differs from the incumbent and was cached under a new id
    WrittenDiverged { script_id: ScriptId },
    /// The body is byte-identical to the incumbent
    IdenticalNoChange,
    NetworkError { message: String },
    CacheWriteError { message: String },
}

impl FetchOutcome {
    /// Map the outcome to the cached script id or the matching job failure
    pub fn into_result(self, script_url: &Url) -> Result<ScriptId> {
        match self {
            Self::WrittenAsNew { script_id } | Self::WrittenDiverged { script_id } => Ok(script_id),
            Self::IdenticalNoChange => Err(ServiceWorkerError::ScriptUnchanged {
                script_url: script_url.to_string(),
            }),
            Self::NetworkError { message } => Err(ServiceWorkerError::Network {
                script_url: script_url.to_string(),
                message,
            }),
            Self::CacheWriteError { message } => Err(ServiceWorkerError::CacheWrite {
                script_url: script_url.to_string(),
                message,
            }),
        }
    }
}

#[async_trait]
pub trait ScriptCacheWriter: Send + Sync {
    async fn fetch_and_cache(&self, script_url: &Url, incumbent: Option<ScriptId>) -> FetchOutcome;
}

/// Script cache whose "network" is a table of bodies set by the embedder
#[derive(Debug, Default)]
pub struct InMemoryScriptCache {
    sources: DashMap<String, Vec<u8>>,
    cached: DashMap<ScriptId, Vec<u8>>,
    next_id: AtomicI64,
}

impl InMemoryScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the body served for a URL
    pub fn serve(&self, script_url: &Url, body: impl Into<Vec<u8>>) {
        self.sources.insert(script_url.to_string(), body.into());
    }

    /// Make a URL unreachable
    pub fn remove(&self, script_url: &Url) {
        self.sources.remove(script_url.as_str());
    }

    pub fn cached_body(&self, script_id: ScriptId) -> Option<Vec<u8>> {
        self.cached.get(&script_id).map(|body| body.clone())
    }
}

#[async_trait]
impl ScriptCacheWriter for InMemoryScriptCache {
    async fn fetch_and_cache(&self, script_url: &Url, incumbent: Option<ScriptId>) -> FetchOutcome {
        let Some(body) = self.sources.get(script_url.as_str()).map(|b| b.clone()) else {
            return FetchOutcome::NetworkError {
                message: "404 Not Found".to_string(),
            };
        };

        let previous = incumbent.and_then(|id| self.cached_body(id));
        if previous.as_deref() == Some(body.as_slice()) {
            return FetchOutcome::IdenticalNoChange;
        }

        let script_id = ScriptId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.cached.insert(script_id, body);
        match previous {
            Some(_) => FetchOutcome::WrittenDiverged { script_id },
            None => FetchOutcome::WrittenAsNew { script_id },
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::errors::{Result, ServiceWorkerError};
use crate::worker::messages::MessageKind;

/// Tuning parameters for a service worker context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Capacity of the context core's command channel
    pub command_buffer: usize,
    /// Capacity of the worker event broadcast buses
    pub event_capacity: usize,
    /// Minimum age of the last update check before `update` refetches the script
    pub update_check_interval: Duration,
    /// Message kinds allowed to cross from a worker into the context
    #[serde(default = "default_allowed_message_kinds")]
    pub allowed_message_kinds: Vec<MessageKind>,
}

fn default_allowed_message_kinds() -> Vec<MessageKind> {
    vec![
        MessageKind::InstallEventFinished,
        MessageKind::ActivateEventFinished,
        MessageKind::FetchEventFinished,
        MessageKind::SyncEventFinished,
        MessageKind::Test,
    ]
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            command_buffer: 1024,
            event_capacity: 256,
            update_check_interval: Duration::from_secs(24 * 60 * 60),
            allowed_message_kinds: default_allowed_message_kinds(),
        }
    }
}

impl ContextConfig {
    /// Create a new builder for ContextConfig
    pub fn builder() -> ContextConfigBuilder {
        ContextConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.command_buffer == 0 {
            return Err(ServiceWorkerError::configuration_field(
                "command_buffer must be greater than 0",
                "command_buffer",
            ));
        }
        if self.event_capacity == 0 {
            return Err(ServiceWorkerError::configuration_field(
                "event_capacity must be greater than 0",
                "event_capacity",
            ));
        }
        if self
            .allowed_message_kinds
            .iter()
            .any(|kind| matches!(kind, MessageKind::Other(_)))
        {
            return Err(ServiceWorkerError::configuration_field(
                "only well-known message kinds may be allowed",
                "allowed_message_kinds",
            ));
        }
        Ok(())
    }

    /// Parse and validate a YAML configuration document
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        Self::from_yaml_str(&contents)
    }

    /// Whether a message kind may be routed from a worker to its instance
    pub fn allows(&self, kind: &MessageKind) -> bool {
        self.allowed_message_kinds.contains(kind)
    }
}

/// Builder for ContextConfig
pub struct ContextConfigBuilder {
    config: ContextConfig,
}

impl ContextConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
        }
    }

    /// Set the command channel capacity
    pub fn command_buffer(mut self, capacity: usize) -> Self {
        self.config.command_buffer = capacity;
        self
    }

    /// Set the event bus capacity
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Set the minimum interval between script update checks
    pub fn update_check_interval(mut self, interval: Duration) -> Self {
        self.config.update_check_interval = interval;
        self
    }

    /// Replace the inbound message allow-list
    pub fn allowed_message_kinds(mut self, kinds: Vec<MessageKind>) -> Self {
        self.config.allowed_message_kinds = kinds;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<ContextConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ContextConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

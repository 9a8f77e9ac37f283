//! Mailbox Configuration
//!
//! Per-mailbox queue settings plus the runtime-wide table of overrides keyed
//! by component address. Loaded from TOML with `MAILBOX_` environment
//! overrides, e.g. `MAILBOX_DEFAULTS__CAPACITY=65536`.

use crate::address::Address;
use crate::error::{MailboxError, Result};
use anyhow::Context;
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Default queue bound: 2^22 messages
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1 << 22;

/// Largest bound the underlying channel accepts
pub const MAX_MAILBOX_CAPACITY: usize = usize::MAX >> 3;

/// What `send` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Fail with `CapacityExceeded`
    #[default]
    Reject,
    /// Wait until the worker frees a slot
    Block,
}

/// Settings of one mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub capacity: usize,
    pub backpressure: BackpressurePolicy,
    /// Start the worker on the first send when a tokio runtime is available
    pub auto_start: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MAILBOX_CAPACITY,
            backpressure: BackpressurePolicy::Reject,
            auto_start: true,
        }
    }
}

impl MailboxConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(MailboxError::configuration(
                "Mailbox capacity must be at least 1",
                Some("capacity"),
            ));
        }
        if self.capacity > MAX_MAILBOX_CAPACITY {
            return Err(MailboxError::configuration(
                format!(
                    "Mailbox capacity {} exceeds maximum {}",
                    self.capacity, MAX_MAILBOX_CAPACITY
                ),
                Some("capacity"),
            ));
        }
        Ok(())
    }
}

/// Runtime-wide mailbox settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Applied to every mailbox without an override
    pub defaults: MailboxConfig,
    /// Overrides keyed by address name (`market_data`, `execution`, ...)
    pub mailboxes: HashMap<String, MailboxConfig>,
}

impl RuntimeConfig {
    /// Load from a TOML file with `MAILBOX_` environment overrides
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        info!("Loading mailbox runtime config: {:?}", path);

        let config = Config::builder()
            .add_source(File::from(path).required(true))
            .add_source(
                Environment::with_prefix("MAILBOX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build mailbox configuration")?;

        let runtime: RuntimeConfig = config
            .try_deserialize()
            .context("Failed to deserialize mailbox configuration")?;
        runtime.validate().context("Invalid mailbox configuration")?;
        Ok(runtime)
    }

    /// Parse inline TOML (no environment overrides)
    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .context("Failed to parse mailbox configuration")?;

        let runtime: RuntimeConfig = config
            .try_deserialize()
            .context("Failed to deserialize mailbox configuration")?;
        runtime.validate().context("Invalid mailbox configuration")?;
        Ok(runtime)
    }

    /// Every entry must be valid and keyed by a known address
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        for (name, mailbox) in &self.mailboxes {
            name.parse::<Address>()
                .map_err(|e| MailboxError::configuration(e, Some("mailboxes")))?;
            mailbox.validate()?;
        }
        Ok(())
    }

    /// Settings for the mailbox serving `address`
    pub fn for_address(&self, address: &Address) -> MailboxConfig {
        match self.mailboxes.get(address.as_str()) {
            Some(config) => {
                debug!(address = %address, "Using mailbox override");
                config.clone()
            }
            None => self.defaults.clone(),
        }
    }
}

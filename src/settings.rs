//! Daemon configuration file.
//!
//! ```toml
//! state_file = "/var/lib/teardown/queue.json"
//!
//! [deletion]
//! max_deletions_at_once = 16
//! permanent_error_patterns = ["(?i)not authorized"]
//!
//! [[providers]]
//! name = "vsphere"
//! stop = ["/opt/vdi/vsphere", "stop", "{id}"]
//! is_stopped = ["/opt/vdi/vsphere", "is-stopped", "{id}"]
//! delete = ["/opt/vdi/vsphere", "delete", "{id}"]
//! is_deleted = ["/opt/vdi/vsphere", "is-deleted", "{id}"]
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;
use teardown_reconciler::{DeletionConfig, ProviderRegistry};
use tracing::info;

use crate::script::CommandProvider;

/// Default queue state file.
pub const DEFAULT_STATE_FILE: &str = "teardown-queue.json";

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DaemonConfig {
    /// Where the queue is persisted.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Worker tuning.
    #[serde(default)]
    pub deletion: DeletionConfig,

    /// Command-line provider adapters.
    #[serde(default)]
    pub providers: Vec<CommandProviderConfig>,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            deletion: DeletionConfig::default(),
            providers: Vec::new(),
        }
    }
}

/// Argument vectors for one command-line provider.
///
/// Every `{id}` in an argument is replaced by the resource id.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandProviderConfig {
    pub name: String,

    #[serde(default)]
    pub stop: Vec<String>,

    /// Graceful stop; falls back to `stop` when empty.
    #[serde(default)]
    pub shutdown: Vec<String>,

    #[serde(default)]
    pub is_stopped: Vec<String>,

    pub delete: Vec<String>,

    pub is_deleted: Vec<String>,

    #[serde(default = "default_must_stop")]
    pub must_stop_before_deletion: bool,

    #[serde(default)]
    pub prefers_soft_shutdown: bool,
}

fn default_must_stop() -> bool {
    true
}

impl CommandProviderConfig {
    fn validate(&self) -> Result<()> {
        ensure!(!self.name.trim().is_empty(), "provider name must not be empty");
        ensure!(
            !self.delete.is_empty(),
            "provider '{}': delete command is required",
            self.name
        );
        ensure!(
            !self.is_deleted.is_empty(),
            "provider '{}': is_deleted command is required",
            self.name
        );
        if self.must_stop_before_deletion {
            ensure!(
                !self.stop.is_empty() && !self.is_stopped.is_empty(),
                "provider '{}': stop and is_stopped commands are required unless must_stop_before_deletion = false",
                self.name
            );
        }
        Ok(())
    }
}

impl DaemonConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            teardown_core::fs::parse_toml(content).context("Invalid daemon configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub async fn load_or_default(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if !exists {
            info!(path = %path.display(), "No configuration file, using defaults");
            return Ok(Self::default());
        }

        let config: Self = teardown_core::fs::read_toml(path)
            .await
            .with_context(|| format!("Failed to load {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate worker settings and provider definitions.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.deletion
            .validate()
            .context("Invalid [deletion] settings")?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            provider.validate()?;
            if !seen.insert(provider.name.as_str()) {
                bail!("provider '{}' is defined twice", provider.name);
            }
        }
        Ok(())
    }

    /// Registry holding one command adapter per configured provider.
    pub fn registry(&self) -> ProviderRegistry {
        self.providers
            .iter()
            .fold(ProviderRegistry::new(), |registry, provider| {
                registry.with(
                    provider.name.clone(),
                    Arc::new(CommandProvider::new(provider.clone())),
                )
            })
    }
}

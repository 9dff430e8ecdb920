//! Worker configuration.
//!
//! Partition names and the reported version string are derived from
//! `cache_prefix` and `version`, so deploying a new version changes every
//! name at once and the previous partitions become unreachable garbage.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, ServiceWorkerError};

/// Service worker configuration, injected at build/deploy time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Prefix shared by every cache name of this site.
    pub cache_prefix: String,

    /// Deployment version, e.g. `v2.0`.
    pub version: String,

    /// Static manifest precached on install. Paths are scope-relative.
    pub static_files: Vec<String>,

    /// Path fragments served network-first.
    pub dynamic_files: Vec<String>,

    /// File extensions served stale-while-revalidate.
    pub asset_extensions: Vec<String>,

    /// Offline fallback document. Must be part of `static_files`.
    pub offline_page: String,

    /// Promote the worker right after install instead of waiting for every
    /// controlled page to close.
    pub skip_waiting_on_install: bool,

    /// Background sync tag handled by the worker.
    pub sync_tag: String,

    /// Push notification defaults.
    pub notification: NotificationDefaults,
}

/// Defaults applied to push notifications with missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub icon: String,
    pub open_title: String,
    pub close_title: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_prefix: "idea".to_string(),
            version: "v2.0".to_string(),
            static_files: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/offline.html".to_string(),
            ],
            dynamic_files: Vec::new(),
            asset_extensions: [
                "jpg", "jpeg", "png", "gif", "webp", "svg", "css", "js", "woff", "woff2", "ttf",
                "eot",
            ]
            .iter()
            .map(|ext| ext.to_string())
            .collect(),
            offline_page: "/offline.html".to_string(),
            skip_waiting_on_install: true,
            sync_tag: "background-sync".to_string(),
            notification: NotificationDefaults::default(),
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            title: "Idea".to_string(),
            body: "You have a new notification".to_string(),
            tag: "idea-notification".to_string(),
            icon: "/assets/images/logo.jpg".to_string(),
            open_title: "Open".to_string(),
            close_title: "Close".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServiceWorkerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// Name of the versioned static partition.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-{}", self.cache_prefix, self.version)
    }

    /// Name of the versioned dynamic partition.
    pub fn dynamic_cache_name(&self) -> String {
        format!("{}-dynamic-{}", self.cache_prefix, self.version)
    }

    /// Version string reported over the control channel.
    pub fn version_name(&self) -> String {
        format!("{}-pwa-{}", self.cache_prefix, self.version)
    }

    /// Check the configuration for values the worker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_prefix.trim().is_empty() {
            return Err(ServiceWorkerError::Config("cache_prefix is empty".into()));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::Config("version is empty".into()));
        }
        if let Some(path) = self
            .static_files
            .iter()
            .chain(&self.dynamic_files)
            .find(|p| !p.starts_with('/'))
        {
            return Err(ServiceWorkerError::Config(format!(
                "path '{path}' must start with '/'"
            )));
        }
        if !self.static_files.contains(&self.offline_page) {
            return Err(ServiceWorkerError::Config(format!(
                "offline page '{}' is not in the static manifest",
                self.offline_page
            )));
        }
        if let Some(ext) = self
            .asset_extensions
            .iter()
            .find(|ext| ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()))
        {
            return Err(ServiceWorkerError::Config(format!(
                "invalid asset extension '{ext}'"
            )));
        }
        Ok(())
    }
}

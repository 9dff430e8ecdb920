//! Route classification: which strategy and partition a path belongs to.

use regex::{Regex, RegexBuilder};

use crate::config::WorkerConfig;
use crate::{Result, ServiceWorkerError};

/// Classification of a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Part of the static manifest: cache-first.
    Static,
    /// Known dynamic page: network-first.
    DynamicPage,
    /// Image, style, script or font: stale-while-revalidate.
    Asset,
    /// Anything else.
    Other,
}

/// Pure path classifier built from the worker configuration.
#[derive(Debug, Clone)]
pub struct RouteClassifier {
    static_files: Vec<String>,
    dynamic_files: Vec<String>,
    asset_pattern: Option<Regex>,
}

impl RouteClassifier {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let alternatives = config
            .asset_extensions
            .iter()
            .map(|ext| regex::escape(ext))
            .collect::<Vec<_>>()
            .join("|");
        let asset_pattern = if alternatives.is_empty() {
            None
        } else {
            let pattern = RegexBuilder::new(&format!(r"\.({alternatives})$"))
                .case_insensitive(true)
                .build()
                .map_err(|e| ServiceWorkerError::Config(format!("asset pattern: {e}")))?;
            Some(pattern)
        };

        Ok(Self {
            static_files: config.static_files.clone(),
            dynamic_files: config.dynamic_files.clone(),
            asset_pattern,
        })
    }

    /// Classify a URL path. Static membership wins over dynamic, dynamic over asset.
    pub fn classify(&self, path: &str) -> RouteClass {
        if self.is_static(path) {
            RouteClass::Static
        } else if self.is_dynamic(path) {
            RouteClass::DynamicPage
        } else if self.is_asset(path) {
            RouteClass::Asset
        } else {
            RouteClass::Other
        }
    }

    /// Path equals or ends with a static manifest entry.
    pub fn is_static(&self, path: &str) -> bool {
        self.static_files
            .iter()
            .any(|file| path == file.as_str() || path.ends_with(file.as_str()))
    }

    /// Path contains a dynamic entry.
    pub fn is_dynamic(&self, path: &str) -> bool {
        self.dynamic_files
            .iter()
            .any(|file| path.contains(file.as_str()))
    }

    pub fn is_asset(&self, path: &str) -> bool {
        self.asset_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(path))
    }
}

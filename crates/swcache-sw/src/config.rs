//! Router configuration

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid static asset {asset}: {reason}")]
    InvalidAsset { asset: String, reason: String },
}

/// Configuration for one worker version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Application name, used as the cache name prefix
    pub app_name: String,

    /// Worker version. Changing it creates fresh partitions on the next install.
    pub version: String,

    /// Origin root the worker controls
    pub scope: Url,

    /// URLs pre-cached into the static partition at install time
    pub static_assets: Vec<String>,

    /// Pattern table
    pub routes: RouteConfig,

    /// Path marker that makes a failed cache-first request an image
    pub image_marker: String,

    /// Activate a freshly installed version even if an older one still controls pages
    pub skip_waiting: bool,
}

/// Ordered pattern lists, one per strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
    /// Path prefixes served cache-first
    pub cache_first: Vec<String>,

    /// Path prefixes served network-first
    pub network_first: Vec<String>,

    /// Exact paths served stale-while-revalidate
    pub stale_while_revalidate: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            app_name: "site".to_string(),
            version: "v1".to_string(),
            scope: Url::parse("http://localhost:3000/").expect("static URL is valid"),
            static_assets: vec![
                "/".to_string(),
                "/manifest.json".to_string(),
                "/images/logo.png".to_string(),
            ],
            routes: RouteConfig::default(),
            image_marker: "/images/".to_string(),
            skip_waiting: false,
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            cache_first: vec![
                "/images/".to_string(),
                "/videos/".to_string(),
                "/fonts/".to_string(),
                "/_next/static/".to_string(),
            ],
            network_first: vec!["/api/".to_string()],
            stale_while_revalidate: vec!["/".to_string()],
        }
    }
}

impl RouterConfig {
    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Check the scope and that every manifest entry resolves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidScope(format!(
                "scheme must be http or https, got {}",
                self.scope.scheme()
            )));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ConfigError::InvalidScope(self.scope.to_string()));
        }
        self.manifest_urls().map(|_| ())
    }

    /// Name of the versioned static partition.
    pub fn static_cache_name(&self) -> String {
        format!("{}-cache-{}-static", self.app_name, self.version)
    }

    /// Name of the versioned dynamic partition.
    pub fn dynamic_cache_name(&self) -> String {
        format!("{}-cache-{}-dynamic", self.app_name, self.version)
    }

    /// Static assets resolved against the scope.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.static_assets
            .iter()
            .map(|asset| {
                self.scope.join(asset).map_err(|e| ConfigError::InvalidAsset {
                    asset: asset.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

//! Runtime settings for the provider process.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_READINESS_TIMEOUT_MS: u64 = 5000;
const DEFAULT_EVICTION_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// How long an attach waits for the bucket to become ready
    pub readiness_timeout_ms: u64,
    /// Request header naming the calling component
    pub source_id_header: String,
    /// Request header selecting one of the caller's links
    pub link_name_header: String,
    /// Link used when a request names none
    pub default_link_name: String,
    /// Unfetched async results older than this are dropped; `None` keeps them forever
    pub async_result_ttl_secs: Option<u64>,
    pub eviction_interval_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: DEFAULT_READINESS_TIMEOUT_MS,
            source_id_header: "source-id".to_string(),
            link_name_header: "link-name".to_string(),
            default_link_name: "default".to_string(),
            async_result_ttl_secs: None,
            eviction_interval_secs: DEFAULT_EVICTION_INTERVAL_SECS,
        }
    }
}

impl ProviderConfig {
    /// Load settings from a JSON file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn async_result_ttl(&self) -> Option<Duration> {
        self.async_result_ttl_secs.map(Duration::from_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

use std::{path::PathBuf, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

static CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Engine configuration.
/// Can be loaded from a TOML file or constructed from defaults.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Glob patterns for files to scan for test declarations
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    /// Glob patterns for files to skip
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    /// Number of discovery workers draining the initial backlog
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Target share of wall-clock time discovery may consume before
    /// workers start inserting delays
    #[serde(default = "default_throttle_fraction")]
    pub throttle_fraction: f64,
    /// Coalescing window for live-edit change events, in milliseconds
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// How long a run waits for in-flight source-map resolutions to settle
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_include() -> Vec<String> {
    vec!["**/*.test.js".to_string(), "**/*.test.ts".to_string()]
}

fn default_exclude() -> Vec<String> {
    vec!["**/node_modules/**".to_string()]
}

fn default_worker_count() -> usize {
    4
}

fn default_throttle_fraction() -> f64 {
    0.5
}

fn default_debounce_ms() -> u64 {
    700
}

fn default_resolve_timeout_ms() -> u64 {
    5000
}

fn default_log_dir() -> String {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("test-explorer-engine/logs")
        .to_string_lossy()
        .to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: default_exclude(),
            worker_count: default_worker_count(),
            throttle_fraction: default_throttle_fraction(),
            debounce_ms: default_debounce_ms(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            log_dir: default_log_dir(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self, EngineError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str::<EngineConfig>(&content)?),
            Err(_) => Err(EngineError::ConfigNotFound(path.to_path_buf())),
        }
    }

    /// Validate configuration and return warnings.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.include.is_empty() {
            warnings.push("no include patterns specified, discovery will find nothing".to_string());
        }
        if self.worker_count == 0 {
            warnings.push("worker_count is 0, falling back to 1".to_string());
        }
        if !(self.throttle_fraction > 0.0 && self.throttle_fraction <= 1.0) {
            warnings.push(format!(
                "throttle_fraction {} is outside (0, 1], falling back to 0.5",
                self.throttle_fraction
            ));
        }

        warnings
    }

    /// Worker count with the zero misconfiguration corrected.
    #[must_use]
    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.max(1)
    }

    /// Throttle fraction with out-of-range misconfiguration corrected.
    #[must_use]
    pub fn effective_throttle_fraction(&self) -> f64 {
        if self.throttle_fraction > 0.0 && self.throttle_fraction <= 1.0 {
            self.throttle_fraction
        } else {
            default_throttle_fraction()
        }
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(&self.log_dir)
    }
}

pub fn init() -> &'static EngineConfig {
    CONFIG.get_or_init(EngineConfig::default)
}

pub fn get() -> &'static EngineConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call config::init() first.")
}

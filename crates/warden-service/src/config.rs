use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use warden_core::engine::{CheckCacheConfig, EngineConfig};
use warden_core::schema::SchemaLimits;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfigValues,
    pub schema_limits: SchemaLimitsConfig,
    pub cache: CacheConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfigValues {
    pub max_depth: usize,
    pub max_concurrent_branches: usize,
    pub timeout_ms: u64,
    pub lookup_page_size: usize,
    pub lookup_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchemaLimitsConfig {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
    pub max_expression_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_capacity: u64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl Default for EngineConfigValues {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            max_depth: defaults.max_depth,
            max_concurrent_branches: defaults.max_concurrent_branches,
            timeout_ms: 30_000,
            lookup_page_size: defaults.lookup_page_size,
            lookup_buffer: defaults.lookup_buffer,
        }
    }
}

impl Default for SchemaLimitsConfig {
    fn default() -> Self {
        let defaults = SchemaLimits::default();
        Self {
            max_types: defaults.max_types,
            max_relations_per_type: defaults.max_relations_per_type,
            max_permissions_per_type: defaults.max_permissions_per_type,
            max_expression_depth: defaults.max_expression_depth,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_capacity: 100_000,
            ttl_secs: 60,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads `config_path` (or defaults), applies `WARDEN_*` overrides and validates.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = if let Some(path) = config_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e.to_string()))?;
            toml::from_str::<AppConfig>(&contents)
                .map_err(|e| ConfigError::ParseToml(e.to_string()))?
        } else {
            AppConfig::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.parse().ok())
        }

        if let Some(n) = parsed(var("WARDEN_ENGINE_MAX_DEPTH")) {
            self.engine.max_depth = n;
        }
        if let Some(n) = parsed(var("WARDEN_ENGINE_MAX_CONCURRENT_BRANCHES")) {
            self.engine.max_concurrent_branches = n;
        }
        if let Some(n) = parsed(var("WARDEN_ENGINE_TIMEOUT_MS")) {
            self.engine.timeout_ms = n;
        }
        if let Some(n) = parsed(var("WARDEN_ENGINE_LOOKUP_PAGE_SIZE")) {
            self.engine.lookup_page_size = n;
        }
        if let Some(n) = parsed(var("WARDEN_ENGINE_LOOKUP_BUFFER")) {
            self.engine.lookup_buffer = n;
        }
        if let Some(enabled) = parsed(var("WARDEN_CACHE_ENABLED")) {
            self.cache.enabled = enabled;
        }
        if let Some(v) = var("WARDEN_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = var("WARDEN_LOG_FORMAT") {
            match v.as_str() {
                "json" => self.log.format = LogFormat::Json,
                "pretty" => self.log.format = LogFormat::Pretty,
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("engine.max_depth", self.engine.max_depth as u64),
            (
                "engine.max_concurrent_branches",
                self.engine.max_concurrent_branches as u64,
            ),
            ("engine.timeout_ms", self.engine.timeout_ms),
            ("engine.lookup_page_size", self.engine.lookup_page_size as u64),
            ("engine.lookup_buffer", self.engine.lookup_buffer as u64),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Validation(format!("{name} must be non-zero")));
        }
        if self.cache.enabled && self.cache.max_capacity == 0 {
            return Err(ConfigError::Validation(
                "cache.max_capacity must be non-zero when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_depth: self.engine.max_depth,
            max_concurrent_branches: self.engine.max_concurrent_branches,
            timeout: Duration::from_millis(self.engine.timeout_ms),
            lookup_page_size: self.engine.lookup_page_size,
            lookup_buffer: self.engine.lookup_buffer,
        }
    }

    pub fn to_schema_limits(&self) -> SchemaLimits {
        SchemaLimits {
            max_types: self.schema_limits.max_types,
            max_relations_per_type: self.schema_limits.max_relations_per_type,
            max_permissions_per_type: self.schema_limits.max_permissions_per_type,
            max_expression_depth: self.schema_limits.max_expression_depth,
        }
    }

    /// `None` when the cache is disabled.
    pub fn to_cache_config(&self) -> Option<CheckCacheConfig> {
        self.cache.enabled.then(|| CheckCacheConfig {
            max_capacity: self.cache.max_capacity,
            ttl: Duration::from_secs(self.cache.ttl_secs),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{0}': {1}")]
    ReadFile(String, String),

    #[error("failed to parse TOML config: {0}")]
    ParseToml(String),

    #[error("config validation failed: {0}")]
    Validation(String),
}

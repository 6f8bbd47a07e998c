//! Configuration management
//!
//! Default config file: `deep-bridge.toml` in the working directory.
//! Environment variables override file values after loading.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::default_capacity;
use crate::llm::{LlmConfig, LlmProvider};
use crate::speech::SpeechConfig;
use crate::task::TaskRetention;

pub const DEFAULT_CONFIG_FILE: &str = "deep-bridge.toml";

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Reader frontend, printed by the CLI as `<frontend_url>/?bridgeHash=<hash>`
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Maximum request body size in bytes (default: 5MB)
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3737".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_max_body_size() -> usize {
    5 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            frontend_url: default_frontend_url(),
            cors: CorsConfig::default(),
            max_body_size: default_max_body_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Allowed origins. Use "*" for any origin.
    #[serde(default = "default_cors_origins")]
    pub origins: Vec<String>,
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: default_cors_origins(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SecurityConfig {
    /// Bearer key required on `/api/*`. Unset means unauthenticated access.
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Applies to every write endpoint
    #[serde(default = "default_write_window_secs")]
    pub write_window_secs: u64,
    #[serde(default = "default_write_max")]
    pub write_max: usize,
    /// Additional limit on `POST /api/content/analyze`
    #[serde(default = "default_analyze_window_secs")]
    pub analyze_window_secs: u64,
    #[serde(default = "default_analyze_max")]
    pub analyze_max: usize,
}

fn default_write_window_secs() -> u64 {
    15 * 60
}

fn default_write_max() -> usize {
    100
}

fn default_analyze_window_secs() -> u64 {
    60 * 60
}

fn default_analyze_max() -> usize {
    20
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            write_window_secs: default_write_window_secs(),
            write_max: default_write_max(),
            analyze_window_secs: default_analyze_window_secs(),
            analyze_max: default_analyze_max(),
        }
    }
}

impl RateLimitConfig {
    pub fn write_window(&self) -> Duration {
        Duration::from_secs(self.write_window_secs)
    }

    pub fn analyze_window(&self) -> Duration {
        Duration::from_secs(self.analyze_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory for the server's analysis cache files
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    /// Entries kept in the server's analysis cache
    #[serde(default = "default_analysis_capacity")]
    pub analysis_capacity: usize,
    /// Per-collection capacity overrides for the client store
    #[serde(default)]
    pub capacities: HashMap<String, usize>,
    /// Entries older than this are removed by the daily cleanup
    #[serde(default = "default_cleanup_max_age_days")]
    pub cleanup_max_age_days: u64,
    /// Local hour (0-23) at which the daily cleanup runs
    #[serde(default = "default_cleanup_hour")]
    pub cleanup_hour: u32,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("~/.deep-bridge/cache")
}

fn default_analysis_capacity() -> usize {
    1000
}

fn default_cleanup_max_age_days() -> u64 {
    30
}

fn default_cleanup_hour() -> u32 {
    2
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            analysis_capacity: default_analysis_capacity(),
            capacities: HashMap::new(),
            cleanup_max_age_days: default_cleanup_max_age_days(),
            cleanup_hour: default_cleanup_hour(),
        }
    }
}

impl CacheConfig {
    /// Configured capacity for a collection, falling back to its built-in default.
    pub fn capacity(&self, collection: &str) -> Option<usize> {
        self.capacities
            .get(collection)
            .copied()
            .or_else(|| default_capacity(collection))
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_age_days * 24 * 60 * 60)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskConfig {
    /// Analyses running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    /// When set, finished and stuck tasks are swept periodically
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_max_content_length() -> usize {
    crate::analysis::MAX_CONTENT_LENGTH
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_content_length: default_max_content_length(),
            retention: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_terminal_ms")]
    pub terminal_ms: u64,
    #[serde(default = "default_stuck_ms")]
    pub stuck_ms: u64,
}

fn default_terminal_ms() -> u64 {
    10 * 60 * 1000
}

fn default_stuck_ms() -> u64 {
    60 * 60 * 1000
}

impl RetentionConfig {
    pub fn retention(&self) -> TaskRetention {
        TaskRetention {
            terminal: Duration::from_millis(self.terminal_ms),
            stuck: Duration::from_millis(self.stuck_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Enable Prometheus metrics at GET /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,bridge=debug".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

/// Expand ~ to home directory in path
pub fn expand_tilde(path: &Path) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        Ok(home.join(rest))
    } else if s == "~" {
        dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))
    } else {
        Ok(path.to_path_buf())
    }
}

/// Replace the port of a `host:port` address.
fn with_port(addr: &str, port: u16) -> String {
    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    format!("{}:{}", host, port)
}

impl Config {
    /// Load config from file path, or create default. Environment
    /// overrides are applied in both cases.
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = config.save(config_path);
            config
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.expand_paths()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment overrides read through `var`.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = var("BRIDGE_API_KEY") {
            self.security.api_key = Some(key);
        }
        if let Some(port) = var("BRIDGE_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| anyhow!("BRIDGE_PORT must be a port number, got '{}'", port))?;
            self.server.bind_addr = with_port(&self.server.bind_addr, port);
        }
        if let Some(url) = var("BRIDGE_FRONTEND_URL") {
            self.server.cors.origins = vec![url.clone()];
            self.server.frontend_url = url;
        }
        if let Some(provider) = var("LLM_PROVIDER") {
            self.llm.provider = LlmProvider::from_name(&provider);
        }
        if let Some(url) = var("LLM_BASE_URL") {
            self.llm.base_url = url;
        }
        if let Some(model) = var("LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = var("TTS_API_URL") {
            self.speech.url = url;
        }
        if let Some(format) = var("LOG_FORMAT") {
            self.observability.log_format = format;
        }
        Ok(())
    }

    /// Expand ~ in all paths
    fn expand_paths(&mut self) -> Result<()> {
        self.cache.dir = expand_tilde(&self.cache.dir)?;
        Ok(())
    }
}

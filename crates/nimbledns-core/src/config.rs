use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_dns_listen")]
    pub listen: String,
}

/// Tuning knobs for the caching core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Upper bound for each of the positive and negative stores.
    #[serde(default = "default_cache_size")]
    pub size: usize,
    /// Negative-cache maximum TTL in seconds.
    #[serde(default = "default_expire")]
    pub expire: u32,
    /// Prefetch threshold as a percentage of the original TTL. 0 disables.
    /// Values above 90 are refused at construction.
    #[serde(default)]
    pub prefetch: u32,
    /// Per-entry token-bucket rate in queries per second. 0 disables.
    #[serde(default)]
    pub rate_limit: u32,
    /// Positive-cache TTL floor in seconds.
    #[serde(default = "default_min_ttl")]
    pub min_ttl: u32,
    /// Positive-cache TTL ceiling in seconds.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_servers")]
    pub servers: Vec<String>,
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: String,
    /// Bearer token for admin requests. Auth is disabled when unset.
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen: default_dns_listen(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size: default_cache_size(),
            expire: default_expire(),
            prefetch: 0,
            rate_limit: 0,
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            servers: default_upstream_servers(),
            timeout_secs: default_upstream_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_api_listen(),
            token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_dns_listen() -> String {
    "0.0.0.0:5353".to_string()
}
fn default_cache_size() -> usize {
    256_000
}
fn default_expire() -> u32 {
    30
}
fn default_min_ttl() -> u32 {
    5
}
fn default_max_ttl() -> u32 {
    86_400
}
fn default_upstream_servers() -> Vec<String> {
    vec!["8.8.8.8:53".to_string(), "1.1.1.1:53".to_string()]
}
fn default_upstream_timeout() -> u64 {
    5
}
fn default_api_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::Error::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }
}

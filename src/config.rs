use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// TTL applied by the store to every entry, or `None` when entries
    /// should never expire.
    ///
    /// An absent `cache.ttl_secs` follows the evaluation interval so that an
    /// entry lives exactly as long as one refresh cycle.
    pub fn store_ttl(&self) -> Option<Duration> {
        match self.cache.ttl_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(self.evaluation.interval()),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the gateway that fronts the registry and its processes.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Id of the registry process whose apex records are resolved.
    #[serde(default = "default_registry_process_id")]
    pub process_id: String,
    /// Deadline (seconds) applied to every registry and process call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            process_id: default_registry_process_id(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_gateway_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_registry_process_id() -> String {
    "agYcCFJtrMG6cqMuZfskIkFTGvUPddICmtQSBIoPdiA".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// Evaluation schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationConfig {
    /// Run the periodic resolver.  When disabled the HTTP layer still serves
    /// whatever the cache already holds.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Seconds between scheduled evaluations.
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Cap on in-flight process fetches, and separately on in-flight cache
    /// writes, within one evaluation.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl EvaluationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_interval(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn bool_true() -> bool {
    true
}

fn default_interval() -> u64 {
    15 * 60
}

fn default_max_concurrency() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Cache store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the store file.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Entry TTL in seconds.  Absent: the evaluation interval.  `0`: no TTL.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Window (milliseconds) during which writes are collected into a
    /// single commit.
    #[serde(default = "default_commit_delay")]
    pub commit_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_secs: None,
            commit_delay_ms: default_commit_delay(),
        }
    }
}

fn default_cache_path() -> String {
    "./data/names".to_string()
}

fn default_commit_delay() -> u64 {
    100
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:6000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Name of the environment variable that holds the admin bearer token.
    #[serde(default = "default_admin_token_env")]
    pub admin_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_token_env: default_admin_token_env(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:6000".to_string()
}

fn default_admin_token_env() -> String {
    "NAMECACHE_ADMIN_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    // An empty document deserializes to `()`, not to an empty mapping.
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents)?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.evaluation.interval_secs > 0,
        "evaluation.interval_secs must be greater than 0"
    );
    anyhow::ensure!(
        config.evaluation.max_concurrency > 0,
        "evaluation.max_concurrency must be greater than 0"
    );
    anyhow::ensure!(
        !config.registry.gateway_url.trim().is_empty(),
        "registry.gateway_url must not be empty"
    );
    config
        .server
        .listen
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server.listen address: {}", config.server.listen))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.evaluation.enabled);
        assert_eq!(config.evaluation.interval_secs, 900);
        assert_eq!(config.evaluation.max_concurrency, 100);
        assert_eq!(config.cache.commit_delay_ms, 100);
        assert_eq!(config.server.listen, "0.0.0.0:6000");
    }

    #[test]
    fn store_ttl_follows_interval_when_unset() {
        let config = parse_config("evaluation:\n  interval_secs: 60\n").unwrap();
        assert_eq!(config.store_ttl(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn store_ttl_zero_disables_expiry() {
        let config = parse_config("cache:\n  ttl_secs: 0\n").unwrap();
        assert_eq!(config.store_ttl(), None);
    }

    #[test]
    fn store_ttl_explicit_value_wins() {
        let config = parse_config("cache:\n  ttl_secs: 3600\n").unwrap();
        assert_eq!(config.store_ttl(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn rejects_zero_interval() {
        let err = parse_config("evaluation:\n  interval_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn rejects_zero_concurrency() {
        assert!(parse_config("evaluation:\n  max_concurrency: 0\n").is_err());
    }

    #[test]
    fn rejects_bad_listen_address() {
        assert!(parse_config("server:\n  listen: not-an-address\n").is_err());
    }

    #[test]
    fn full_document_parses() {
        let yaml = r#"
registry:
  gateway_url: http://localhost:8080
  process_id: registry-1
  request_timeout_secs: 5
evaluation:
  enabled: false
  interval_secs: 120
  max_concurrency: 8
cache:
  path: /var/lib/namecache
  ttl_secs: 240
  commit_delay_ms: 20
server:
  listen: 127.0.0.1:7000
  admin_token_env: ADMIN_KEY
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.registry.process_id, "registry-1");
        assert_eq!(config.registry.request_timeout_secs, 5);
        assert!(!config.evaluation.enabled);
        assert_eq!(config.evaluation.max_concurrency, 8);
        assert_eq!(config.cache.path, "/var/lib/namecache");
        assert_eq!(config.cache.commit_delay_ms, 20);
        assert_eq!(config.server.admin_token_env, "ADMIN_KEY");
    }

    #[test]
    fn shipped_config_parses() {
        let config = parse_config(include_str!("../config.example.yaml")).unwrap();
        assert_eq!(config.store_ttl(), Some(Duration::from_secs(900)));
        assert_eq!(config.server.listen, "0.0.0.0:6000");
    }
}

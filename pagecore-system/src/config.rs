//! Typed system configuration
//!
//! Every recognized option, with the same names an operator writes in
//! the config file. Validation happens once at load time; anything that
//! fails to parse refuses startup with a readable message rather than
//! degrading at runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use pagecore_fetch::HttpsOptions;

use crate::{Error, Result};

/// Default memcached port.
pub const MEMCACHED_DEFAULT_PORT: u16 = 11211;
/// Default Redis port.
pub const REDIS_DEFAULT_PORT: u16 = 6379;

/// One `host[:port]` endpoint of an external cache cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExternalServerSpec {
    pub host: String,
    pub port: u16,
}

impl ExternalServerSpec {
    /// Parse `host[:port]`, falling back to `default_port`. Ports must
    /// lie in 1..=65535.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(Error::InvalidServerSpec {
                spec: spec.to_string(),
                reason: "empty host".to_string(),
            });
        }
        let (host, port) = match spec.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str.parse::<u32>().map_err(|_| Error::InvalidServerSpec {
                    spec: spec.to_string(),
                    reason: format!("port {port_str:?} is not a number"),
                })?;
                if port == 0 || port > u16::MAX as u32 {
                    return Err(Error::InvalidServerSpec {
                        spec: spec.to_string(),
                        reason: format!("port {port} outside 1-65535"),
                    });
                }
                (host, port as u16)
            }
            None => (spec, default_port),
        };
        if host.is_empty() {
            return Err(Error::InvalidServerSpec {
                spec: spec.to_string(),
                reason: "empty host".to_string(),
            });
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parse a comma-separated cluster list.
    pub fn parse_list(specs: &str, default_port: u16) -> Result<Vec<Self>> {
        specs
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| Self::parse(s, default_port))
            .collect()
    }
}

impl std::fmt::Display for ExternalServerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// All recognized options, with serde defaults matching the shipped
/// defaults.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    // File cache (L4).
    pub file_cache_path: Option<PathBuf>,
    pub file_cache_clean_interval_ms: i64,
    pub file_cache_clean_size_kb: u64,
    pub file_cache_clean_inode_limit: u64,

    // In-process LRU (L1).
    pub lru_cache_kb_per_process: u64,

    // External caches (L3), endpoint parsing only.
    pub memcached_servers: Option<String>,
    pub memcached_threads: u32,
    pub memcached_timeout_us: u64,
    pub redis_server: Option<String>,
    pub redis_reconnection_delay_ms: u64,
    pub redis_timeout_us: u64,

    // Shared memory (L2) and locking.
    pub use_shared_mem_locking: bool,
    pub default_shared_memory_cache_kb: u64,

    // Metadata compression.
    pub compress_metadata_cache: bool,

    // Fetcher.
    pub fetcher_proxy: Option<String>,
    pub https_options: String,
    pub ssl_cert_directory: Option<PathBuf>,
    pub ssl_cert_file: Option<PathBuf>,
    pub rate_limit_background_fetches: bool,

    // In-place recording.
    pub ipro_max_response_bytes: usize,
    pub ipro_max_concurrent_recordings: usize,

    // Expensive-op admission.
    pub popularity_contest_max_inflight_requests: i64,
    pub popularity_contest_max_queue_size: usize,

    // Observability.
    pub slow_file_latency_threshold_us: i64,
    pub statistics_logging_interval_ms: i64,
    pub statistics_logging_max_file_size_kb: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            file_cache_path: None,
            file_cache_clean_interval_ms: 3_600_000,
            file_cache_clean_size_kb: 100 * 1024,
            file_cache_clean_inode_limit: 50_000,
            lru_cache_kb_per_process: 1024,
            memcached_servers: None,
            memcached_threads: 1,
            memcached_timeout_us: 50_000,
            redis_server: None,
            redis_reconnection_delay_ms: 100,
            redis_timeout_us: 50_000,
            use_shared_mem_locking: false,
            default_shared_memory_cache_kb: 0,
            compress_metadata_cache: false,
            fetcher_proxy: None,
            https_options: "enable".to_string(),
            ssl_cert_directory: None,
            ssl_cert_file: None,
            rate_limit_background_fetches: false,
            ipro_max_response_bytes: pagecore_fetch::recorder::DEFAULT_MAX_RESPONSE_BYTES,
            ipro_max_concurrent_recordings:
                pagecore_fetch::recorder::DEFAULT_MAX_CONCURRENT_RECORDINGS,
            popularity_contest_max_inflight_requests: -1,
            popularity_contest_max_queue_size: 500,
            slow_file_latency_threshold_us:
                pagecore_cache::file::DEFAULT_SLOW_FILE_LATENCY_THRESHOLD_US,
            statistics_logging_interval_ms: 3_600_000,
            statistics_logging_max_file_size_kb: 1024,
        }
    }
}

/// Options that only exist in parsed form.
#[derive(Clone, Debug)]
pub struct ValidatedConfig {
    pub https: HttpsOptions,
    pub memcached: Vec<ExternalServerSpec>,
    pub redis: Option<ExternalServerSpec>,
}

impl SystemConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<(Self, ValidatedConfig)> {
        let raw = std::fs::read_to_string(path)?;
        let config: SystemConfig = serde_json::from_str(&raw)?;
        let validated = config.validate()?;
        Ok((config, validated))
    }

    /// Parse every derived option; the first failure aborts startup.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        let https = HttpsOptions::parse_directive(&self.https_options)?;
        let memcached = match &self.memcached_servers {
            Some(specs) => ExternalServerSpec::parse_list(specs, MEMCACHED_DEFAULT_PORT)?,
            None => Vec::new(),
        };
        let redis = match &self.redis_server {
            Some(spec) => Some(ExternalServerSpec::parse(spec, REDIS_DEFAULT_PORT)?),
            None => None,
        };
        Ok(ValidatedConfig {
            https,
            memcached,
            redis,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_spec_with_explicit_port() {
        let spec = ExternalServerSpec::parse("cache1.example.com:12345", MEMCACHED_DEFAULT_PORT)
            .unwrap();
        assert_eq!(spec.host, "cache1.example.com");
        assert_eq!(spec.port, 12345);
    }

    #[test]
    fn test_spec_defaults_per_backend() {
        let m = ExternalServerSpec::parse("mc.local", MEMCACHED_DEFAULT_PORT).unwrap();
        assert_eq!(m.port, 11211);
        let r = ExternalServerSpec::parse("redis.local", REDIS_DEFAULT_PORT).unwrap();
        assert_eq!(r.port, 6379);
    }

    #[test]
    fn test_spec_rejects_bad_ports() {
        for bad in ["h:0", "h:65536", "h:abc", "h:"] {
            assert!(
                ExternalServerSpec::parse(bad, MEMCACHED_DEFAULT_PORT).is_err(),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_spec_rejects_empty_host() {
        assert!(ExternalServerSpec::parse("", MEMCACHED_DEFAULT_PORT).is_err());
        assert!(ExternalServerSpec::parse(":11211", MEMCACHED_DEFAULT_PORT).is_err());
    }

    #[test]
    fn test_cluster_list() {
        let list =
            ExternalServerSpec::parse_list("a:1000, b, c:2000", MEMCACHED_DEFAULT_PORT).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].to_string(), "a:1000");
        assert_eq!(list[1].to_string(), "b:11211");
        assert_eq!(list[2].to_string(), "c:2000");
    }

    #[test]
    fn test_defaults_validate() {
        let config = SystemConfig::default();
        let validated = config.validate().unwrap();
        assert!(validated.https.enable);
        assert!(validated.memcached.is_empty());
        assert!(validated.redis.is_none());
    }

    #[test]
    fn test_bad_https_directive_refuses_startup() {
        let config = SystemConfig {
            https_options: "enable,allow_everything".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SystemConfig {
            lru_cache_kb_per_process: 2048,
            memcached_servers: Some("mc1,mc2:2222".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SystemConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lru_cache_kb_per_process, 2048);
        assert_eq!(back.validate().unwrap().memcached.len(), 2);
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        let err = serde_json::from_str::<SystemConfig>(r#"{"no_such_option": 1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("pagecore.json");
        std::fs::write(
            &path,
            r#"{"file_cache_path": "/var/cache/pagecore", "redis_server": "r1:7000"}"#,
        )
        .unwrap();
        let (config, validated) = SystemConfig::from_json_file(&path).unwrap();
        assert_eq!(
            config.file_cache_path.as_deref(),
            Some(std::path::Path::new("/var/cache/pagecore"))
        );
        assert_eq!(validated.redis.unwrap().port, 7000);
    }
}

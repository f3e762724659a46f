//! Process configuration
//!
//! Read from a RON file, then overridden by environment variables. Every
//! section is optional and falls back to its defaults.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use postmail_delivery::{
    DnsConfig, EngineConfig, PoolConfig, RateLimitConfig, RetryPolicy, WorkerConfig,
};
use postmail_store::QueueConfig;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "POSTMAIL_CONFIG";

const DEFAULT_PATHS: [&str; 2] = [
    "./postmail.config.ron",
    "/etc/postmail/postmail.config.ron",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("POSTMAIL_CONFIG points to non-existent file: {}", .0.display())]
    Missing(PathBuf),

    #[error("Failed to read config from {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config from {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Key and identity used for DKIM signatures.
#[derive(Clone, Deserialize)]
pub struct DkimConfig {
    /// PKCS#8 PEM encoded RSA private key
    pub private_key: String,
    pub domain: String,
    pub selector: String,
}

impl std::fmt::Debug for DkimConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkimConfig")
            .field("domain", &self.domain)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    /// Messages go out unsigned when absent.
    #[serde(default)]
    pub dkim: Option<DkimConfig>,
}

fn parse<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

impl Config {
    /// Locate, read, override from the process environment, and validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or parsed, an environment
    /// override is malformed, or the result is inconsistent.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::find_file()? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Precedence: `POSTMAIL_CONFIG`, then `./postmail.config.ron`, then
    /// `/etc/postmail/postmail.config.ron`. `None` means run on defaults.
    fn find_file() -> Result<Option<PathBuf>, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(ConfigError::Missing(path));
        }

        Ok(DEFAULT_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists()))
    }

    /// # Errors
    ///
    /// Returns an error if the file can't be read or is not valid RON.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        ron::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides, looking each variable up with `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a value that doesn't parse.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        macro_rules! set {
            ($name:literal => $field:expr) => {
                if let Some(value) = lookup($name) {
                    $field = parse($name, &value)?;
                }
            };
        }

        set!("MIN_WORKERS" => self.pool.min_workers);
        set!("MAX_WORKERS" => self.pool.max_workers);
        set!("QUEUE_THRESHOLD_HIGH" => self.pool.queue_threshold_high);
        set!("QUEUE_THRESHOLD_LOW" => self.pool.queue_threshold_low);
        set!("WORKER_CHECK_INTERVAL" => self.pool.check_interval_ms);
        set!("LOCK_TTL_SECONDS" => self.worker.lock_ttl_secs);
        set!("SMTP_PORT" => self.engine.smtp_port);
        set!("SOCKET_TIMEOUT_MS" => self.engine.socket_timeout_ms);
        set!("MAX_RETRIES" => self.retry.max_retries);
        set!("RETRY_BASE_MS" => self.retry.base_delay_ms);
        set!("RATE_LIMIT_PER_MINUTE" => self.rate_limit.per_minute);

        if let Some(helo_name) = lookup("HELO_NAME") {
            self.engine.helo_name = helo_name;
        }

        let key = lookup("DKIM_PRIVATE_KEY");
        let domain = lookup("DKIM_DOMAIN");
        let selector = lookup("DKIM_SELECTOR");
        if let Some(dkim) = self.dkim.as_mut() {
            if let Some(key) = key {
                dkim.private_key = key;
            }
            if let Some(domain) = domain {
                dkim.domain = domain;
            }
            if let Some(selector) = selector {
                dkim.selector = selector;
            }
        } else if let Some(private_key) = key {
            let (Some(domain), Some(selector)) = (domain, selector) else {
                return Err(ConfigError::Invalid(
                    "DKIM_PRIVATE_KEY requires DKIM_DOMAIN and DKIM_SELECTOR".to_string(),
                ));
            };
            self.dkim = Some(DkimConfig {
                private_key,
                domain,
                selector,
            });
        }

        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first inconsistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;

        if pool.min_workers == 0 {
            return Err(ConfigError::Invalid("MIN_WORKERS must be at least 1".to_string()));
        }
        if pool.min_workers > pool.max_workers {
            return Err(ConfigError::Invalid(format!(
                "MIN_WORKERS ({}) is greater than MAX_WORKERS ({})",
                pool.min_workers, pool.max_workers
            )));
        }
        if pool.queue_threshold_high == 0 {
            return Err(ConfigError::Invalid(
                "QUEUE_THRESHOLD_HIGH must be greater than 0".to_string(),
            ));
        }
        if pool.queue_threshold_low > pool.queue_threshold_high {
            return Err(ConfigError::Invalid(format!(
                "QUEUE_THRESHOLD_LOW ({}) is greater than QUEUE_THRESHOLD_HIGH ({})",
                pool.queue_threshold_low, pool.queue_threshold_high
            )));
        }
        if pool.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_CHECK_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if self.worker.lock_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "LOCK_TTL_SECONDS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Unacknowledged entries are offered again once the lock on their email
    /// could have expired.
    #[must_use]
    pub const fn queue(&self) -> QueueConfig {
        QueueConfig {
            visibility_timeout_secs: self.worker.lock_ttl_secs,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use pretty_assertions::assert_eq;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.pool.min_workers, 2);
        assert_eq!(config.pool.max_workers, 10);
        assert_eq!(config.engine.smtp_port, 587);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 10_000);
        assert_eq!(config.engine.socket_timeout_ms, 30_000);
        assert_eq!(config.worker.lock_ttl_secs, 60);
        assert!(config.dkim.is_none());
    }

    #[test]
    fn parses_partial_ron() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"(
                engine: (helo_name: "mx.example.org", smtp_port: 25),
                pool: (min_workers: 3, max_workers: 6),
                dns: (overrides: {{ "test.example": "127.0.0.1" }}),
                dkim: Some((private_key: "pem", domain: "example.org", selector: "s1")),
            )"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();

        assert_eq!(config.engine.helo_name, "mx.example.org");
        assert_eq!(config.engine.smtp_port, 25);
        assert_eq!(config.engine.socket_timeout_ms, 30_000);
        assert_eq!(config.pool.min_workers, 3);
        assert_eq!(config.pool.queue_threshold_high, 100);
        assert_eq!(
            config.dns.overrides.get("test.example").unwrap().to_string(),
            "127.0.0.1"
        );
        assert_eq!(config.dkim.unwrap().selector, "s1");
    }

    #[test]
    fn unreadable_file_is_reported() {
        let err = Config::from_file(Path::new("/nonexistent/postmail.config.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn malformed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "(pool: (min_workers: \"many\"))").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("MIN_WORKERS", "4"),
                ("MAX_WORKERS", "20"),
                ("QUEUE_THRESHOLD_HIGH", "500"),
                ("QUEUE_THRESHOLD_LOW", "50"),
                ("WORKER_CHECK_INTERVAL", "1000"),
                ("LOCK_TTL_SECONDS", "120"),
                ("SMTP_PORT", "2525"),
                ("MAX_RETRIES", "5"),
                ("RETRY_BASE_MS", "500"),
                ("SOCKET_TIMEOUT_MS", "9000"),
                ("RATE_LIMIT_PER_MINUTE", "60"),
                ("HELO_NAME", "relay.example.org"),
            ]))
            .unwrap();

        assert_eq!(config.pool.min_workers, 4);
        assert_eq!(config.pool.max_workers, 20);
        assert_eq!(config.pool.queue_threshold_high, 500);
        assert_eq!(config.pool.queue_threshold_low, 50);
        assert_eq!(config.pool.check_interval_ms, 1000);
        assert_eq!(config.worker.lock_ttl_secs, 120);
        assert_eq!(config.queue().visibility_timeout_secs, 120);
        assert_eq!(config.engine.smtp_port, 2525);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.engine.socket_timeout_ms, 9000);
        assert_eq!(config.rate_limit.per_minute, 60);
        assert_eq!(config.engine.helo_name, "relay.example.org");
    }

    #[test]
    fn malformed_override_is_rejected() {
        let err = Config::default()
            .apply_overrides(env(&[("SMTP_PORT", "submission")]))
            .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue { name: "SMTP_PORT", .. }
        ));
    }

    #[test]
    fn dkim_from_environment() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("DKIM_PRIVATE_KEY", "pem"),
                ("DKIM_DOMAIN", "example.org"),
                ("DKIM_SELECTOR", "mail"),
            ]))
            .unwrap();

        let dkim = config.dkim.unwrap();
        assert_eq!(dkim.domain, "example.org");
        assert_eq!(dkim.selector, "mail");
    }

    #[test]
    fn dkim_key_alone_is_incomplete() {
        let err = Config::default()
            .apply_overrides(env(&[("DKIM_PRIVATE_KEY", "pem")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn inconsistent_pool_bounds_are_rejected() {
        let mut config = Config::default();
        config.pool.min_workers = 5;
        config.pool.max_workers = 4;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.min_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.queue_threshold_low = 200;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.queue_threshold_high = 0;
        config.pool.queue_threshold_low = 0;
        assert!(config.validate().is_err());
    }
}

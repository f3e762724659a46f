//! Mail exchange resolution.
//!
//! A domain's MX records are looked up and each exchange is resolved to one
//! IPv4 and one IPv6 address where available. There is no A/AAAA fallback for
//! domains without MX records: such a domain has no mail servers.
//!
//! # Caching Strategy
//!
//! - Results are cached for the smallest MX record TTL, bounded by
//!   `min_cache_ttl_secs` (60s) and `max_cache_ttl_secs` (3600s)
//! - `DashMap` gives concurrent access without a global lock
//! - Static `overrides` from configuration bypass DNS entirely

use std::{
    collections::HashMap,
    fmt::Debug,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::rr::Name,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The domain has no MX records.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// Domain does not exist (NXDOMAIN).
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    /// DNS query timed out.
    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

/// One candidate exchange for a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailExchange {
    pub exchange: String,
    /// MX preference, lower is more preferred.
    pub priority: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl MailExchange {
    #[must_use]
    pub fn new(exchange: impl Into<String>, priority: u16) -> Self {
        Self {
            exchange: exchange.into(),
            priority,
            ipv4: None,
            ipv6: None,
        }
    }

    #[must_use]
    pub const fn with_ipv4(mut self, address: Ipv4Addr) -> Self {
        self.ipv4 = Some(address);
        self
    }

    #[must_use]
    pub const fn with_ipv6(mut self, address: Ipv6Addr) -> Self {
        self.ipv6 = Some(address);
        self
    }

    /// The address to connect to, IPv4 first.
    #[must_use]
    pub fn address(&self) -> Option<IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .or_else(|| self.ipv6.map(IpAddr::V6))
    }
}

/// Pick the most preferred exchange that has an address.
///
/// Ties on priority keep resolution order.
#[must_use]
pub fn select_exchange(exchanges: &[MailExchange]) -> Option<(&MailExchange, IpAddr)> {
    exchanges
        .iter()
        .filter_map(|mx| mx.address().map(|address| (mx, address)))
        .min_by_key(|(mx, _)| mx.priority)
}

/// Resolves a recipient domain to its candidate exchanges.
#[async_trait]
pub trait MxResolver: Send + Sync + Debug {
    /// # Errors
    ///
    /// Returns [`DnsError::NoMailServers`] when the domain has no exchanges,
    /// and a temporary error when the lookup itself failed.
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailExchange>>, DnsError>;
}

/// Configuration for the DNS resolver.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,

    /// Fixed exchange address per domain, used instead of DNS.
    #[serde(default)]
    pub overrides: HashMap<String, IpAddr>,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
            overrides: HashMap::new(),
        }
    }
}

impl DnsConfig {
    /// Cache lifetime for a result whose smallest record TTL is `ttl`.
    #[must_use]
    pub fn cache_ttl(&self, ttl: u32) -> Duration {
        Duration::from_secs(
            u64::from(ttl)
                .max(self.min_cache_ttl_secs)
                .min(self.max_cache_ttl_secs),
        )
    }

    fn override_for(&self, domain: &str) -> Option<MailExchange> {
        self.overrides.get(domain).map(|address| {
            let exchange = MailExchange::new(domain, 0);
            match address {
                IpAddr::V4(v4) => exchange.with_ipv4(*v4),
                IpAddr::V6(v6) => exchange.with_ipv6(*v6),
            }
        })
    }
}

#[derive(Debug, Clone)]
struct CachedResult {
    exchanges: Arc<Vec<MailExchange>>,
    expires_at: Instant,
}

/// `hickory` backed [`MxResolver`] with a TTL cache.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Build a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(Self::options(&config))
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    /// Build a resolver that queries the given name servers.
    #[must_use]
    pub fn with_resolver_config(resolver_config: ResolverConfig, config: DnsConfig) -> Self {
        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(Self::options(&config))
                .build();

        Self {
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    fn options(config: &DnsConfig) -> ResolverOpts {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);
        opts
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<MailExchange>, u32), DnsError> {
        let mx_lookup = match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => lookup,
            Err(err) if err.is_nx_domain() => {
                return Err(DnsError::DomainNotFound(domain.to_string()));
            }
            Err(err) if err.is_no_records_found() => {
                return Err(DnsError::NoMailServers(domain.to_string()));
            }
            Err(err) => {
                warn!(domain, error = %err, "MX lookup failed");
                return Err(DnsError::LookupFailed(err));
            }
        };

        let ttl = mx_lookup
            .as_lookup()
            .records()
            .iter()
            .map(hickory_resolver::proto::rr::Record::ttl)
            .min()
            .unwrap_or(300);

        let mut exchanges = Vec::new();
        for mx in mx_lookup.iter() {
            let name = mx.exchange().clone();
            let mut exchange = MailExchange::new(
                name.to_utf8().trim_end_matches('.').to_string(),
                mx.preference(),
            );
            exchange.ipv4 = self.first_ipv4(&name).await;
            exchange.ipv6 = self.first_ipv6(&name).await;

            debug!(
                domain,
                exchange = %exchange.exchange,
                priority = exchange.priority,
                ipv4 = ?exchange.ipv4,
                ipv6 = ?exchange.ipv6,
                "Resolved MX record"
            );
            exchanges.push(exchange);
        }

        if exchanges.is_empty() {
            return Err(DnsError::NoMailServers(domain.to_string()));
        }

        exchanges.sort_by_key(|mx| mx.priority);
        Ok((exchanges, ttl))
    }

    async fn first_ipv4(&self, name: &Name) -> Option<Ipv4Addr> {
        match self.resolver.ipv4_lookup(name.clone()).await {
            Ok(lookup) => lookup.iter().next().map(|a| a.0),
            Err(err) => {
                warn!(exchange = %name, error = %err, "No IPv4 address for exchange");
                None
            }
        }
    }

    async fn first_ipv6(&self, name: &Name) -> Option<Ipv6Addr> {
        match self.resolver.ipv6_lookup(name.clone()).await {
            Ok(lookup) => lookup.iter().next().map(|aaaa| aaaa.0),
            Err(err) => {
                debug!(exchange = %name, error = %err, "No IPv6 address for exchange");
                None
            }
        }
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailExchange>>, DnsError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if let Some(exchange) = self.config.override_for(&domain) {
            debug!(%domain, "Using configured exchange override");
            return Ok(Arc::new(vec![exchange]));
        }

        if let Some(cached) = self.cache.get(&domain) {
            if cached.expires_at > Instant::now() {
                debug!(%domain, "MX cache hit");
                return Ok(Arc::clone(&cached.exchanges));
            }
            debug!(%domain, "MX cache entry expired");
        }

        let (exchanges, ttl) = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs.saturating_mul(2)),
            self.lookup(&domain),
        )
        .await
        .map_err(|_| DnsError::Timeout(domain.clone()))??;

        let exchanges = Arc::new(exchanges);
        let cache_ttl = self.config.cache_ttl(ttl);
        self.cache.insert(
            domain.clone(),
            CachedResult {
                exchanges: Arc::clone(&exchanges),
                expires_at: Instant::now() + cache_ttl,
            },
        );

        debug!(
            %domain,
            dns_ttl = ttl,
            cache_ttl = cache_ttl.as_secs(),
            count = exchanges.len(),
            "Cached MX result"
        );
        Ok(exchanges)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn selects_lowest_priority_with_an_address() {
        let exchanges = [
            MailExchange::new("mx0.example.com", 0),
            MailExchange::new("mx2.example.com", 20).with_ipv4(Ipv4Addr::new(192, 0, 2, 2)),
            MailExchange::new("mx1.example.com", 10).with_ipv6(Ipv6Addr::LOCALHOST),
        ];

        let (mx, address) = select_exchange(&exchanges).unwrap();
        assert_eq!(mx.exchange, "mx1.example.com");
        assert_eq!(address, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn prefers_ipv4_over_ipv6() {
        let mx = MailExchange::new("mx.example.com", 10)
            .with_ipv6(Ipv6Addr::LOCALHOST)
            .with_ipv4(Ipv4Addr::LOCALHOST);
        assert_eq!(mx.address(), Some(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    }

    #[test]
    fn no_address_means_no_selection() {
        let exchanges = [MailExchange::new("mx.example.com", 10)];
        assert!(select_exchange(&exchanges).is_none());
        assert!(select_exchange(&[]).is_none());
    }

    #[test]
    fn cache_ttl_is_clamped() {
        let config = DnsConfig::default();
        assert_eq!(config.cache_ttl(5), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(600), Duration::from_secs(600));
        assert_eq!(config.cache_ttl(86_400), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn overrides_bypass_dns() {
        let mut config = DnsConfig::default();
        config
            .overrides
            .insert("test.example".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        let resolver = DnsResolver::with_resolver_config(ResolverConfig::default(), config);

        let exchanges = resolver.resolve("Test.Example.").await.unwrap();
        assert_eq!(
            exchanges.as_slice(),
            &[MailExchange::new("test.example", 0).with_ipv4(Ipv4Addr::LOCALHOST)]
        );
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn resolves_real_domain() {
        let resolver = DnsResolver::new(DnsConfig::default()).unwrap();
        let exchanges = resolver.resolve("gmail.com").await.unwrap();

        assert!(!exchanges.is_empty());
        assert!(exchanges.windows(2).all(|w| w[0].priority <= w[1].priority));
        assert!(select_exchange(&exchanges).is_some());
    }

    #[test]
    fn dns_error_is_temporary() {
        assert!(DnsError::Timeout("example.com".to_string()).is_temporary());
        assert!(!DnsError::NoMailServers("example.com".to_string()).is_temporary());
        assert!(!DnsError::DomainNotFound("example.com".to_string()).is_temporary());
    }
}

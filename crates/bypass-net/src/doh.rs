//! DNS-over-HTTPS Resolver Pool
//!
//! Resolves hostnames through an ordered list of DoH providers so that a
//! tampered system resolver is never consulted for the target host.
//!
//! - Providers are built once; one that fails to build is logged and skipped
//! - Lookups walk the providers in priority order, first answer wins
//! - No adaptive ranking: order is fixed at construction

use crate::client::{ClientConfig, TransportClient};
use crate::fallback::first_success_async;
use async_trait::async_trait;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use tracing::{debug, error, info, warn};
use url::Url;

/// Path served by every provider the resolver library can talk to
const DOH_PATH: &str = "/dns-query";

/// DoH resolution errors
#[derive(Debug, Error)]
pub enum DohError {
    #[error("No DoH providers configured")]
    NoProvidersConfigured,

    #[error("All {attempts} DoH providers exhausted for {host}: {last}")]
    AllProvidersExhausted {
        host: String,
        attempts: usize,
        #[source]
        last: Box<DohError>,
    },

    #[error("Invalid DoH endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("Bootstrap resolution failed for {host}: {reason}")]
    Bootstrap { host: String, reason: String },

    #[error("{provider} lookup failed for {host}: {reason}")]
    Lookup {
        provider: String,
        host: String,
        reason: String,
    },

    #[error("{provider} returned no addresses for {host}")]
    NoAddresses { provider: String, host: String },
}

/// DoH resolver configuration
#[derive(Debug, Clone)]
pub struct DohConfig {
    /// Timeout for a single query
    pub timeout: Duration,
    /// Query attempts per provider before moving on
    pub attempts: usize,
    /// Per-provider answer cache size
    pub cache_size: usize,
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            attempts: 2,
            cache_size: 256,
        }
    }
}

/// A parsed DoH endpoint URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DohEndpoint {
    url: String,
    host: String,
    port: u16,
}

impl DohEndpoint {
    /// Parse `https://host[:port]/dns-query`
    pub fn parse(url: &str) -> Result<Self, DohError> {
        let invalid = |reason: &str| DohError::InvalidEndpoint {
            endpoint: url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(url).map_err(|e| invalid(&e.to_string()))?;

        if parsed.scheme() != "https" {
            return Err(invalid("scheme must be https"));
        }

        let host = match parsed.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(invalid("missing host")),
        };

        let path = parsed.path();
        if !(path.is_empty() || path == "/" || path == DOH_PATH) {
            return Err(invalid("only the /dns-query path is supported"));
        }

        Ok(Self {
            url: url.to_string(),
            host,
            port: parsed.port().unwrap_or(443),
        })
    }

    /// Original endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Provider host (also used as the TLS server name)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Provider port
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Anything that can turn a hostname into addresses
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Resolve a hostname
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DohError>;
}

/// A single DoH provider backed by a hickory resolver
pub struct DohProvider {
    endpoint: DohEndpoint,
    resolver: TokioAsyncResolver,
}

impl DohProvider {
    /// Build a resolver for one endpoint.
    ///
    /// The provider's own address is bootstrapped here: IP literals are used
    /// as-is, hostnames go through system DNS once.
    pub async fn connect(endpoint: DohEndpoint, config: &DohConfig) -> Result<Self, DohError> {
        let ips = bootstrap(&endpoint).await?;

        let group = NameServerConfigGroup::from_ips_https(
            &ips,
            endpoint.port,
            endpoint.host.clone(),
            true,
        );

        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.timeout = config.timeout;
        opts.attempts = config.attempts;
        opts.cache_size = config.cache_size;

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts);

        Ok(Self { endpoint, resolver })
    }
}

#[async_trait]
impl Resolve for DohProvider {
    fn name(&self) -> &str {
        self.endpoint.url()
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DohError> {
        let lookup = self.resolver.lookup_ip(host).await.map_err(|e| DohError::Lookup {
            provider: self.name().to_string(),
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DohError::NoAddresses {
                provider: self.name().to_string(),
                host: host.to_string(),
            });
        }

        Ok(addresses)
    }
}

async fn bootstrap(endpoint: &DohEndpoint) -> Result<Vec<IpAddr>, DohError> {
    if let Ok(ip) = endpoint.host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }

    let addrs = lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| DohError::Bootstrap {
            host: endpoint.host.clone(),
            reason: e.to_string(),
        })?;

    let ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
    if ips.is_empty() {
        return Err(DohError::Bootstrap {
            host: endpoint.host.clone(),
            reason: "no addresses".to_string(),
        });
    }

    Ok(ips)
}

/// Ordered DoH providers, first = primary
pub struct DohResolverPool {
    providers: Vec<Arc<dyn Resolve>>,
}

impl DohResolverPool {
    /// Build providers for every endpoint, skipping the ones that fail.
    pub async fn build(endpoints: &[String], config: &DohConfig) -> Self {
        let mut providers: Vec<Arc<dyn Resolve>> = Vec::with_capacity(endpoints.len());

        for url in endpoints {
            let provider = match DohEndpoint::parse(url) {
                Ok(endpoint) => DohProvider::connect(endpoint, config).await,
                Err(e) => Err(e),
            };

            match provider {
                Ok(provider) => {
                    debug!("Added DoH provider {}", url);
                    providers.push(Arc::new(provider));
                }
                Err(e) => warn!("Failed to initialize DoH provider {}: {}", url, e),
            }
        }

        info!(
            "DoH resolver pool ready ({} of {} providers)",
            providers.len(),
            endpoints.len()
        );

        Self { providers }
    }

    /// Pool over already-built resolvers, in the given order
    pub fn from_resolvers(providers: Vec<Arc<dyn Resolve>>) -> Self {
        Self { providers }
    }

    /// Pool with no providers (degraded mode)
    pub fn empty() -> Self {
        Self { providers: Vec::new() }
    }

    /// Number of usable providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when no provider could be built
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider names in priority order
    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Resolve a hostname, trying each provider in order
    pub async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DohError> {
        if self.providers.is_empty() {
            return Err(DohError::NoProvidersConfigured);
        }

        let result = first_success_async(&self.providers, |provider| {
            let provider = Arc::clone(provider);
            async move {
                let result = provider.lookup(host).await;
                match &result {
                    Ok(addresses) => debug!(
                        "DoH lookup via {} for {}: {:?}",
                        provider.name(),
                        host,
                        addresses
                    ),
                    Err(e) => warn!("DoH provider {} failed, trying next: {}", provider.name(), e),
                }
                result
            }
        })
        .await;

        match result {
            Ok((_, addresses)) => Ok(addresses),
            Err(exhausted) => {
                error!("All DoH providers failed for {}", host);
                Err(DohError::AllProvidersExhausted {
                    host: host.to_string(),
                    attempts: exhausted.attempts,
                    last: Box::new(
                        exhausted
                            .last_error
                            .unwrap_or(DohError::NoProvidersConfigured),
                    ),
                })
            }
        }
    }

    /// Client that resolves through this pool, or system DNS if the pool
    /// is empty.
    pub fn build_client(pool: &Arc<Self>, config: &ClientConfig) -> TransportClient {
        if pool.is_empty() {
            warn!("No DoH providers available, using system DNS (degraded mode)");
            return TransportClient::system(config.clone());
        }

        TransportClient::with_doh(Arc::clone(pool), config.clone())
    }
}

impl std::fmt::Debug for DohResolverPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DohResolverPool")
            .field("providers", &self.provider_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RouteKind;
    use crate::testing::StaticResolver;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_endpoint_parse() {
        let ep = DohEndpoint::parse("https://1.1.1.1/dns-query").unwrap();
        assert_eq!(ep.host(), "1.1.1.1");
        assert_eq!(ep.port(), 443);

        let ep = DohEndpoint::parse("https://dns.adguard.com:8443/dns-query").unwrap();
        assert_eq!(ep.host(), "dns.adguard.com");
        assert_eq!(ep.port(), 8443);

        assert!(DohEndpoint::parse("https://dns.example").is_ok());
    }

    #[test]
    fn test_endpoint_rejects_malformed() {
        for bad in [
            "not a url",
            "http://1.1.1.1/dns-query",
            "https://1.1.1.1/resolve",
        ] {
            assert!(
                matches!(DohEndpoint::parse(bad), Err(DohError::InvalidEndpoint { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_priority_order() {
        let a = Arc::new(StaticResolver::failing("a"));
        let b = Arc::new(StaticResolver::answering("b", vec![addr(2)]));
        let c = Arc::new(StaticResolver::answering("c", vec![addr(3)]));

        let pool = DohResolverPool::from_resolvers(vec![
            a.clone() as Arc<dyn Resolve>,
            b.clone() as Arc<dyn Resolve>,
            c.clone() as Arc<dyn Resolve>,
        ]);
        let addresses = pool.resolve("example.com").await.unwrap();

        assert_eq!(addresses, vec![addr(2)]);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_exhausted() {
        let pool = DohResolverPool::from_resolvers(vec![
            Arc::new(StaticResolver::failing("a")) as Arc<dyn Resolve>,
            Arc::new(StaticResolver::failing("b")) as Arc<dyn Resolve>,
        ]);

        match pool.resolve("example.com").await {
            Err(DohError::AllProvidersExhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, DohError::Lookup { ref provider, .. } if provider == "b"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_pool_fails_fast() {
        let pool = DohResolverPool::empty();
        assert!(matches!(
            pool.resolve("example.com").await,
            Err(DohError::NoProvidersConfigured)
        ));
    }

    #[tokio::test]
    async fn test_build_skips_bad_endpoints() {
        let endpoints = vec![
            "not a url".to_string(),
            "http://8.8.8.8/dns-query".to_string(),
            "https://9.9.9.9/custom".to_string(),
        ];

        let pool = DohResolverPool::build(&endpoints, &DohConfig::default()).await;
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_build_keeps_order() {
        let endpoints = vec![
            "https://1.1.1.1/dns-query".to_string(),
            "bogus".to_string(),
            "https://8.8.8.8/dns-query".to_string(),
        ];

        // IP literal providers need no bootstrap, so this stays offline
        let pool = DohResolverPool::build(&endpoints, &DohConfig::default()).await;
        assert_eq!(
            pool.provider_names(),
            vec!["https://1.1.1.1/dns-query", "https://8.8.8.8/dns-query"]
        );
    }

    #[test]
    fn test_degraded_client() {
        let pool = Arc::new(DohResolverPool::empty());
        let client = DohResolverPool::build_client(&pool, &ClientConfig::default());
        assert_eq!(client.route_kind(), RouteKind::System);

        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::answering("a", vec![addr(1)]));
        let pool = Arc::new(DohResolverPool::from_resolvers(vec![resolver]));
        let client = DohResolverPool::build_client(&pool, &ClientConfig::default());
        assert_eq!(client.route_kind(), RouteKind::Doh);
    }
}

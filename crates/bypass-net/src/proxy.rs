//! Proxy Client Factory
//!
//! Picks the transport for the proxy tier from a fixed candidate list.
//!
//! # Selection
//!
//! ```text
//! SOCKS5 candidates → HTTP candidates → DoH client (never absent)
//! ```
//!
//! Selection only checks that a client can be constructed for the endpoint.
//! Reachability is discovered by the request itself.

use crate::client::{ClientConfig, TransportClient};
use crate::doh::DohResolverPool;
use crate::fallback::first_success;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl ProxyKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
        }
    }
}

/// A relay endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    /// Name used in logs
    pub label: String,
    pub host: String,
    pub port: u16,
    pub kind: ProxyKind,
}

impl ProxyEndpoint {
    pub fn new(label: impl Into<String>, host: impl Into<String>, port: u16, kind: ProxyKind) -> Self {
        Self {
            label: label.into(),
            host: host.into(),
            port,
            kind,
        }
    }

    pub fn socks5(label: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(label, host, port, ProxyKind::Socks5)
    }

    pub fn http(label: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(label, host, port, ProxyKind::Http)
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        crate::connect::authority(&self.host, self.port)
    }

    /// e.g. `socks5://185.196.10.100:1080`
    pub fn proxy_url(&self) -> String {
        format!("{}://{}", self.kind.scheme(), self.authority())
    }

    /// Check that a client can be built for this endpoint
    pub fn validate(&self) -> Result<(), ProxyError> {
        let fail = |reason: &str| ProxyError::ConstructionFailed {
            label: self.label.clone(),
            reason: reason.to_string(),
        };

        if self.host.is_empty() {
            return Err(fail("empty host"));
        }
        if self.host.len() > 255 {
            return Err(fail("host longer than 255 bytes"));
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(fail("host contains whitespace"));
        }
        if self.port == 0 {
            return Err(fail("port must be non-zero"));
        }
        if self.host.parse::<IpAddr>().is_err() && !is_dns_name(&self.host) {
            return Err(fail("host is neither an IP address nor a DNS name"));
        }

        Ok(())
    }
}

impl std::fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.proxy_url())
    }
}

fn is_dns_name(host: &str) -> bool {
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Cannot build client for proxy {label}: {reason}")]
    ConstructionFailed { label: String, reason: String },
}

/// Builds proxy-routed clients from an ordered candidate list
pub struct ProxyClientFactory {
    candidates: Vec<ProxyEndpoint>,
    config: ClientConfig,
    fallback: Arc<DohResolverPool>,
}

impl ProxyClientFactory {
    /// SOCKS5 candidates are moved ahead of HTTP ones, keeping their
    /// relative order.
    pub fn new(candidates: Vec<ProxyEndpoint>, config: ClientConfig, fallback: Arc<DohResolverPool>) -> Self {
        let (mut ordered, http): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|c| c.kind == ProxyKind::Socks5);
        ordered.extend(http);

        debug!(
            "Proxy factory with {} candidates: {:?}",
            ordered.len(),
            ordered.iter().map(|c| c.label.as_str()).collect::<Vec<_>>()
        );

        Self {
            candidates: ordered,
            config,
            fallback,
        }
    }

    /// Candidates in attempt order
    pub fn candidates(&self) -> &[ProxyEndpoint] {
        &self.candidates
    }

    /// Client through the first usable candidate, or the DoH client
    pub fn build_client(&self) -> TransportClient {
        let result = first_success(&self.candidates, |candidate| {
            TransportClient::via_proxy(candidate.clone(), self.config.clone()).inspect_err(|e| {
                warn!("Skipping proxy {}: {}", candidate, e);
            })
        });

        match result {
            Ok((index, client)) => {
                info!("Using proxy {}", self.candidates[index]);
                client
            }
            Err(exhausted) => {
                warn!(
                    "No usable proxy among {} candidates, falling back to DoH",
                    exhausted.attempts
                );
                DohResolverPool::build_client(&self.fallback, &self.config)
            }
        }
    }

    /// Client through the fixed last-resort relay
    pub fn build_relay_client(&self, relay: &ProxyEndpoint) -> TransportClient {
        match TransportClient::via_proxy(relay.clone(), self.config.clone()) {
            Ok(client) => {
                info!("Using relay {}", relay);
                client
            }
            Err(e) => {
                warn!("Relay unusable, falling back to DoH: {}", e);
                DohResolverPool::build_client(&self.fallback, &self.config)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Route, RouteKind};
    use crate::doh::Resolve;
    use crate::testing::StaticResolver;

    fn doh_pool() -> Arc<DohResolverPool> {
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::answering("static", vec![]));
        Arc::new(DohResolverPool::from_resolvers(vec![resolver]))
    }

    #[test]
    fn test_validate() {
        assert!(ProxyEndpoint::socks5("ok", "185.196.10.100", 1080).validate().is_ok());
        assert!(ProxyEndpoint::http("ok", "proxy.example.com", 8080).validate().is_ok());
        assert!(ProxyEndpoint::http("v6", "::1", 8080).validate().is_ok());

        for bad in [
            ProxyEndpoint::socks5("empty", "", 1080),
            ProxyEndpoint::socks5("space", "bad host", 1080),
            ProxyEndpoint::socks5("port", "10.0.0.1", 0),
            ProxyEndpoint::socks5("chars", "bad/host", 1080),
            ProxyEndpoint::socks5("long", "a".repeat(256), 1080),
        ] {
            assert!(
                matches!(bad.validate(), Err(ProxyError::ConstructionFailed { .. })),
                "{} should be rejected",
                bad.label
            );
        }
    }

    #[test]
    fn test_proxy_url() {
        assert_eq!(
            ProxyEndpoint::socks5("a", "185.196.10.100", 1080).proxy_url(),
            "socks5://185.196.10.100:1080"
        );
        assert_eq!(ProxyEndpoint::http("b", "::1", 80).proxy_url(), "http://[::1]:80");
    }

    #[test]
    fn test_serde() {
        let endpoint: ProxyEndpoint =
            serde_json::from_str(r#"{"label":"x","host":"10.0.0.1","port":1080,"kind":"socks5"}"#).unwrap();
        assert_eq!(endpoint, ProxyEndpoint::socks5("x", "10.0.0.1", 1080));
    }

    #[test]
    fn test_socks5_first() {
        let factory = ProxyClientFactory::new(
            vec![
                ProxyEndpoint::http("h1", "10.0.0.1", 80),
                ProxyEndpoint::socks5("s1", "10.0.0.2", 1080),
                ProxyEndpoint::http("h2", "10.0.0.3", 8080),
                ProxyEndpoint::socks5("s2", "10.0.0.4", 1080),
            ],
            ClientConfig::default(),
            doh_pool(),
        );

        let labels: Vec<_> = factory.candidates().iter().map(|c| c.label.as_str()).collect();
        assert_eq!(labels, vec!["s1", "s2", "h1", "h2"]);
    }

    #[test]
    fn test_first_valid_candidate_wins() {
        let factory = ProxyClientFactory::new(
            vec![
                ProxyEndpoint::socks5("broken", "", 1080),
                ProxyEndpoint::socks5("good", "10.0.0.2", 1080),
                ProxyEndpoint::http("later", "10.0.0.3", 8080),
            ],
            ClientConfig::default(),
            doh_pool(),
        );

        match factory.build_client().route() {
            Route::Proxy(endpoint) => assert_eq!(endpoint.label, "good"),
            other => panic!("unexpected route: {other}"),
        }
    }

    #[test]
    fn test_total_fallback_to_doh() {
        let factory = ProxyClientFactory::new(
            vec![
                ProxyEndpoint::socks5("a", "", 1080),
                ProxyEndpoint::http("b", "10.0.0.1", 0),
            ],
            ClientConfig::default(),
            doh_pool(),
        );
        assert_eq!(factory.build_client().route_kind(), RouteKind::Doh);

        let empty = ProxyClientFactory::new(vec![], ClientConfig::default(), doh_pool());
        assert_eq!(empty.build_client().route_kind(), RouteKind::Doh);
    }

    #[test]
    fn test_relay_client() {
        let factory = ProxyClientFactory::new(vec![], ClientConfig::default(), doh_pool());

        let relay = ProxyEndpoint::http("relay", "162.159.192.1", 80);
        match factory.build_relay_client(&relay).route() {
            Route::Proxy(endpoint) => assert_eq!(endpoint, &relay),
            other => panic!("unexpected route: {other}"),
        }

        let broken = ProxyEndpoint::http("relay", "", 80);
        assert_eq!(factory.build_relay_client(&broken).route_kind(), RouteKind::Doh);
    }
}

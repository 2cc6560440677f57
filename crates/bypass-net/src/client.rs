//! Transport Client
//!
//! HTTP/1.1 GET client bound to a single route. The route decides how the
//! target host is reached:
//!
//! - `System`: system DNS, direct TCP
//! - `Doh`: addresses from the DoH resolver pool, direct TCP
//! - `Proxy`: TCP to the proxy, then a SOCKS5 or HTTP CONNECT tunnel
//!
//! Every connection is single-use (`Connection: close`). Dropping a pending
//! `get` future tears down the socket and its connection task.

use crate::connect::{http_connect, socks5_connect};
use crate::doh::DohResolverPool;
use crate::fallback::first_success_async;
use crate::proxy::{ProxyEndpoint, ProxyError, ProxyKind};
use http_body_util::{BodyExt, Empty, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, ACCEPT, CONNECTION, CONTENT_TYPE, HOST, LOCATION, USER_AGENT};
use hyper::{Request, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace};
use url::Url;

/// Desktop Chrome, so the content host serves the regular page
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DOCUMENT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Name resolution failed for {host}: {reason}")]
    NameResolution { host: String, reason: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),

    #[error("Proxy {label} failed: {reason}")]
    Proxy { label: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Transport client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-address connect timeout (also bounds proxy and TLS handshakes)
    pub connect_timeout: Duration,
    /// Request plus body read timeout
    pub read_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
    /// Redirects followed before giving up
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            max_redirects: 20,
        }
    }
}

/// How a client reaches the target host
#[derive(Debug, Clone)]
pub enum Route {
    System,
    Doh(Arc<DohResolverPool>),
    Proxy(ProxyEndpoint),
}

/// Route without its payload, for logs and assertions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    System,
    Doh,
    Proxy,
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        match self {
            Route::System => RouteKind::System,
            Route::Doh(_) => RouteKind::Doh,
            Route::Proxy(_) => RouteKind::Proxy,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::System => f.write_str("system DNS"),
            Route::Doh(pool) => write!(f, "DoH ({} providers)", pool.len()),
            Route::Proxy(endpoint) => write!(f, "proxy {}", endpoint),
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
    /// Final URL (after redirects)
    pub final_url: String,
    /// Redirects followed
    pub redirects: usize,
    /// Total time including redirects
    pub total_time: Duration,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// Split a Content-Type value into its MIME type (lowercased, no
/// parameters) and `charset` parameter
pub fn parse_content_type(content_type: &str) -> (Option<String>, Option<String>) {
    let mut params = content_type.split(';');

    let mime_type = params
        .next()
        .map(|mime| mime.trim().to_ascii_lowercase())
        .filter(|mime| !mime.is_empty());

    let charset = params
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|charset| !charset.is_empty());

    (mime_type, charset)
}

/// Aborts the hyper connection task when the exchange ends or is dropped
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Parsed request target
struct Target {
    url: Url,
    host: String,
    port: u16,
    https: bool,
}

impl Target {
    fn parse(url: &Url) -> Result<Self, TransportError> {
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(TransportError::InvalidUrl(format!("unsupported scheme {other}")));
            }
        };

        let host = match url.host() {
            Some(url::Host::Domain(d)) => d.to_string(),
            Some(url::Host::Ipv4(ip)) => ip.to_string(),
            Some(url::Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(TransportError::InvalidUrl(format!("no host in {url}"))),
        };

        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidUrl(format!("no port for {url}")))?;

        Ok(Self {
            url: url.clone(),
            host,
            port,
            https,
        })
    }

    /// Host header value (port only when non-default)
    fn host_header(&self) -> String {
        // host_str keeps the brackets of IPv6 literals
        let host = self.url.host_str().unwrap_or(&self.host);
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// `/path?query`
    fn origin_form(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Full URL without fragment, for plain HTTP through an HTTP proxy
    fn absolute_form(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.to_string()
    }
}

fn tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();

    CONNECTOR
        .get_or_init(|| {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();

            TlsConnector::from(Arc::new(tls_config))
        })
        .clone()
}

/// HTTP client bound to one route
pub struct TransportClient {
    route: Route,
    config: ClientConfig,
}

impl TransportClient {
    /// Client resolving through the system resolver
    pub fn system(config: ClientConfig) -> Self {
        Self::new(Route::System, config)
    }

    /// Client resolving through a DoH pool
    pub fn with_doh(pool: Arc<DohResolverPool>, config: ClientConfig) -> Self {
        Self::new(Route::Doh(pool), config)
    }

    /// Client tunnelling through a proxy. Fails if the endpoint is unusable.
    pub fn via_proxy(endpoint: ProxyEndpoint, config: ClientConfig) -> Result<Self, ProxyError> {
        endpoint.validate()?;
        Ok(Self::new(Route::Proxy(endpoint), config))
    }

    fn new(route: Route, config: ClientConfig) -> Self {
        debug!(
            "Transport client via {} (connect: {:?}, read: {:?})",
            route, config.connect_timeout, config.read_timeout
        );
        Self { route, config }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn route_kind(&self) -> RouteKind {
        self.route.kind()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Perform a GET request, following redirects
    pub async fn get(&self, url: &str) -> Result<Response, TransportError> {
        let start = Instant::now();
        let mut current = Url::parse(url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        let mut redirects = 0;

        loop {
            let target = Target::parse(&current)?;
            let (status, headers, body) = self.exchange(&target).await?;

            if status.is_redirection() {
                if let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) {
                    if redirects >= self.config.max_redirects {
                        return Err(TransportError::TooManyRedirects(self.config.max_redirects));
                    }

                    let next = current
                        .join(location)
                        .map_err(|e| TransportError::InvalidUrl(format!("bad redirect {location}: {e}")))?;
                    debug!("Redirect {} -> {} ({})", current, next, status);

                    current = next;
                    redirects += 1;
                    continue;
                }
            }

            let total_time = start.elapsed();
            info!(
                "GET {} -> {} ({} bytes, {:?}, via {})",
                current,
                status,
                body.len(),
                total_time,
                self.route
            );

            return Ok(Response {
                status,
                headers,
                body,
                final_url: current.to_string(),
                redirects,
                total_time,
            });
        }
    }

    /// One request/response on a fresh connection
    async fn exchange(&self, target: &Target) -> Result<(StatusCode, HeaderMap, Bytes), TransportError> {
        let stream = self.open(target).await?;

        let absolute = matches!(&self.route, Route::Proxy(p) if p.kind == ProxyKind::Http) && !target.https;
        let request_target = if absolute {
            target.absolute_form()
        } else {
            target.origin_form()
        };

        let request = Request::get(request_target)
            .header(HOST, target.host_header())
            .header(USER_AGENT, &self.config.user_agent)
            .header(ACCEPT, HeaderValue::from_static(DOCUMENT_ACCEPT))
            .header(CONNECTION, HeaderValue::from_static("close"))
            .body(Empty::<Bytes>::new())
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if target.https {
            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|_| TransportError::Tls(format!("invalid server name {}", target.host)))?;

            let tls_stream = timeout(
                self.config.connect_timeout,
                tls_connector().connect(server_name, stream),
            )
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))?
            .map_err(|e| TransportError::Tls(e.to_string()))?;

            self.send(tls_stream, request).await
        } else {
            self.send(stream, request).await
        }
    }

    /// Request plus body under the read timeout
    async fn send<S>(
        &self,
        io: S,
        request: Request<Empty<Bytes>>,
    ) -> Result<(StatusCode, HeaderMap, Bytes), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let max_body_size = self.config.max_body_size;

        let exchange = async move {
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;

            let _guard = ConnectionGuard(tokio::spawn(async move {
                if let Err(e) = conn.await {
                    trace!("Connection closed: {}", e);
                }
            }));

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| TransportError::Http(e.to_string()))?;

            let status = response.status();
            let headers = response.headers().clone();

            let body = Limited::new(response.into_body(), max_body_size)
                .collect()
                .await
                .map_err(|e| {
                    if e.is::<LengthLimitError>() {
                        TransportError::BodyTooLarge(max_body_size)
                    } else {
                        TransportError::Http(e.to_string())
                    }
                })?
                .to_bytes();

            Ok::<_, TransportError>((status, headers, body))
        };

        timeout(self.config.read_timeout, exchange)
            .await
            .map_err(|_| TransportError::ReadTimeout(self.config.read_timeout))?
    }

    /// TCP stream to the target, tunnelled if the route is a proxy
    async fn open(&self, target: &Target) -> Result<TcpStream, TransportError> {
        match &self.route {
            Route::System => {
                let addrs = system_lookup(&target.host, target.port)
                    .await
                    .map_err(|e| TransportError::NameResolution {
                        host: target.host.clone(),
                        reason: e.to_string(),
                    })?;
                connect_any(&addrs, self.config.connect_timeout).await
            }
            Route::Doh(pool) => {
                let ips = match target.host.parse::<IpAddr>() {
                    Ok(ip) => vec![ip],
                    Err(_) => pool
                        .resolve(&target.host)
                        .await
                        .map_err(|e| TransportError::NameResolution {
                            host: target.host.clone(),
                            reason: e.to_string(),
                        })?,
                };
                let addrs: Vec<SocketAddr> = ips
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, target.port))
                    .collect();
                connect_any(&addrs, self.config.connect_timeout).await
            }
            Route::Proxy(endpoint) => self.open_tunnel(endpoint, target).await,
        }
    }

    async fn open_tunnel(&self, endpoint: &ProxyEndpoint, target: &Target) -> Result<TcpStream, TransportError> {
        // The proxy's own address never goes through DoH
        let addrs = system_lookup(&endpoint.host, endpoint.port)
            .await
            .map_err(|e| TransportError::Proxy {
                label: endpoint.label.clone(),
                reason: format!("cannot resolve proxy host: {e}"),
            })?;
        let mut stream = connect_any(&addrs, self.config.connect_timeout).await?;

        let handshake = async {
            match endpoint.kind {
                ProxyKind::Socks5 => {
                    socks5_connect(&mut stream, &endpoint.label, &target.host, target.port).await
                }
                ProxyKind::Http if target.https => {
                    http_connect(&mut stream, &endpoint.label, &target.host, target.port).await
                }
                // Plain HTTP is forwarded in absolute form, no tunnel needed
                ProxyKind::Http => Ok(()),
            }
        };

        timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| TransportError::ConnectTimeout(self.config.connect_timeout))??;

        Ok(stream)
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("route", &self.route.to_string())
            .field("config", &self.config)
            .finish()
    }
}

async fn system_lookup(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no addresses"));
    }
    Ok(addrs)
}

/// Connect to the first reachable address, each under its own timeout
async fn connect_any(addrs: &[SocketAddr], connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let result = first_success_async(addrs, |addr| {
        let addr = *addr;
        async move {
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    trace!("Connected to {}", addr);
                    Ok(stream)
                }
                Ok(Err(e)) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    Err(TransportError::Io(e))
                }
                Err(_) => {
                    debug!("Connect to {} timed out", addr);
                    Err(TransportError::ConnectTimeout(connect_timeout))
                }
            }
        }
    })
    .await;

    match result {
        Ok((_, stream)) => Ok(stream),
        Err(exhausted) => Err(exhausted.last_error.unwrap_or_else(|| {
            TransportError::Io(io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to connect to"))
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, BlockingSignal};
    use crate::doh::Resolve;
    use crate::testing::{HttpProxy, OriginServer, Socks5Relay, StaticResolver};
    use std::net::Ipv4Addr;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn doh_client(resolver: StaticResolver) -> TransportClient {
        let resolver: Arc<dyn Resolve> = Arc::new(resolver);
        let pool = Arc::new(DohResolverPool::from_resolvers(vec![resolver]));
        TransportClient::with_doh(pool, ClientConfig::default())
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.max_redirects, 20);
        assert!(config.user_agent.contains("Chrome"));
    }

    #[test]
    fn test_parse_content_type() {
        assert_eq!(
            parse_content_type("text/HTML; charset=\"ISO-8859-1\""),
            (Some("text/html".to_string()), Some("ISO-8859-1".to_string()))
        );
        assert_eq!(
            parse_content_type("application/json"),
            (Some("application/json".to_string()), None)
        );
        assert_eq!(
            parse_content_type("text/plain; format=flowed; Charset=utf-8"),
            (Some("text/plain".to_string()), Some("utf-8".to_string()))
        );
        assert_eq!(parse_content_type(" ; charset="), (None, None));
    }

    #[test]
    fn test_target_forms() {
        let url = Url::parse("http://example.com:8080/a/b?x=1#frag").unwrap();
        let target = Target::parse(&url).unwrap();
        assert_eq!(target.port, 8080);
        assert_eq!(target.host_header(), "example.com:8080");
        assert_eq!(target.origin_form(), "/a/b?x=1");
        assert_eq!(target.absolute_form(), "http://example.com:8080/a/b?x=1");

        let url = Url::parse("https://example.com/").unwrap();
        let target = Target::parse(&url).unwrap();
        assert!(target.https);
        assert_eq!(target.port, 443);
        assert_eq!(target.host_header(), "example.com");

        let url = Url::parse("ftp://example.com/").unwrap();
        assert!(matches!(Target::parse(&url), Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_route_kind() {
        assert_eq!(TransportClient::system(ClientConfig::default()).route_kind(), RouteKind::System);

        let endpoint = ProxyEndpoint::socks5("p", "127.0.0.1", 1080);
        let client = TransportClient::via_proxy(endpoint, ClientConfig::default()).unwrap();
        assert_eq!(client.route_kind(), RouteKind::Proxy);

        let bad = ProxyEndpoint::http("bad", "", 80);
        assert!(TransportClient::via_proxy(bad, ClientConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let client = TransportClient::system(ClientConfig::default());
        let err = client.get("not a url").await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidUrl(_)));
        assert_eq!(classify(&err), BlockingSignal::None);
    }

    #[tokio::test]
    async fn test_get_via_doh() {
        let origin = OriginServer::start("<html>ok</html>").await;
        let client = doh_client(StaticResolver::answering("static", vec![localhost()]));

        let response = client.get(&origin.url("origin.test", "/article")).await.unwrap();
        assert!(response.is_success());
        assert_eq!(&response.body[..], b"<html>ok</html>");
        assert_eq!(response.content_type(), Some("text/html; charset=utf-8"));
        assert_eq!(origin.requests(), 1);
    }

    #[tokio::test]
    async fn test_doh_failure_is_name_resolution() {
        let client = doh_client(StaticResolver::failing("static"));

        let err = client.get("http://origin.test/").await.unwrap_err();
        assert!(matches!(err, TransportError::NameResolution { .. }));
        assert_eq!(classify(&err), BlockingSignal::NameResolutionBlocked);
    }

    #[tokio::test]
    async fn test_follows_redirects() {
        let origin = OriginServer::start("done").await;
        origin.redirect("/old", "/new");

        let client = doh_client(StaticResolver::answering("static", vec![localhost()]));
        let response = client.get(&origin.url("origin.test", "/old")).await.unwrap();

        assert_eq!(response.redirects, 1);
        assert!(response.final_url.ends_with("/new"));
        assert_eq!(origin.requests(), 2);
    }

    #[tokio::test]
    async fn test_redirect_loop() {
        let origin = OriginServer::start("never").await;
        origin.redirect("/loop", "/loop");

        let config = ClientConfig {
            max_redirects: 3,
            ..ClientConfig::default()
        };
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::answering("static", vec![localhost()]));
        let client = TransportClient::with_doh(Arc::new(DohResolverPool::from_resolvers(vec![resolver])), config);

        let err = client.get(&origin.url("origin.test", "/loop")).await.unwrap_err();
        assert!(matches!(err, TransportError::TooManyRedirects(3)));
        assert_eq!(origin.requests(), 4);
    }

    #[tokio::test]
    async fn test_body_limit() {
        let origin = OriginServer::start(&"x".repeat(4096)).await;
        let config = ClientConfig {
            max_body_size: 1024,
            ..ClientConfig::default()
        };
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::answering("static", vec![localhost()]));
        let client = TransportClient::with_doh(Arc::new(DohResolverPool::from_resolvers(vec![resolver])), config);

        let err = client.get(&origin.url("origin.test", "/")).await.unwrap_err();
        assert!(matches!(err, TransportError::BodyTooLarge(1024)));
    }

    #[tokio::test]
    async fn test_get_via_socks5_sends_hostname() {
        let origin = OriginServer::start("tunnelled").await;
        let relay = Socks5Relay::start(origin.addr()).await;

        let endpoint = ProxyEndpoint::socks5("relay", "127.0.0.1", relay.addr().port());
        let client = TransportClient::via_proxy(endpoint, ClientConfig::default()).unwrap();

        // Never resolved locally: only the relay sees the name
        let response = client.get("http://blocked.invalid/page").await.unwrap();
        assert_eq!(&response.body[..], b"tunnelled");
        assert_eq!(relay.targets(), vec!["blocked.invalid:80".to_string()]);
        assert_eq!(origin.hosts(), vec!["blocked.invalid".to_string()]);
    }

    #[tokio::test]
    async fn test_get_via_http_proxy_absolute_form() {
        let origin = OriginServer::start("forwarded").await;
        let proxy = HttpProxy::start(origin.addr()).await;

        let endpoint = ProxyEndpoint::http("proxy", "127.0.0.1", proxy.addr().port());
        let client = TransportClient::via_proxy(endpoint, ClientConfig::default()).unwrap();

        let response = client.get("http://blocked.invalid/a?b=1").await.unwrap();
        assert_eq!(&response.body[..], b"forwarded");
        assert_eq!(
            proxy.targets(),
            vec!["GET http://blocked.invalid/a?b=1 HTTP/1.1".to_string()]
        );
    }

    fn localhost_client(config: ClientConfig) -> TransportClient {
        let resolver: Arc<dyn Resolve> = Arc::new(StaticResolver::answering("static", vec![localhost()]));
        TransportClient::with_doh(Arc::new(DohResolverPool::from_resolvers(vec![resolver])), config)
    }

    #[tokio::test]
    async fn test_silent_server_is_read_timeout() {
        // Connections complete through the backlog, nothing is ever answered
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let read_timeout = Duration::from_millis(300);
        let client = localhost_client(ClientConfig {
            read_timeout,
            ..ClientConfig::default()
        });

        let start = Instant::now();
        let err = client.get(&format!("http://origin.test:{port}/")).await.unwrap_err();

        assert!(matches!(err, TransportError::ReadTimeout(d) if d == read_timeout));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(classify(&err), BlockingSignal::ConnectionBlocked);
    }

    #[tokio::test]
    async fn test_stalled_tls_handshake_is_connect_timeout() {
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();

        let connect_timeout = Duration::from_millis(300);
        let client = localhost_client(ClientConfig {
            connect_timeout,
            ..ClientConfig::default()
        });

        let err = client.get(&format!("https://origin.test:{port}/")).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectTimeout(d) if d == connect_timeout));
        assert_eq!(classify(&err), BlockingSignal::ConnectionBlocked);
    }

    #[tokio::test]
    async fn test_reset_tls_handshake_is_tls_blocked() {
        // Reads the ClientHello, then drops the connection
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;

            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 5];
            let _ = stream.read_exact(&mut hello).await;
            assert_eq!(hello[0], 0x16, "expected a TLS handshake record");
        });

        let client = localhost_client(ClientConfig::default());
        let err = client.get(&format!("https://origin.test:{port}/")).await.unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, TransportError::Tls(_)), "unexpected error: {err:?}");
        assert_eq!(classify(&err), BlockingSignal::TlsBlocked);
    }

    #[tokio::test]
    async fn test_dead_proxy_is_not_blocking() {
        let port = crate::testing::closed_port().await;
        let endpoint = ProxyEndpoint::socks5("dead", "127.0.0.1", port);
        let client = TransportClient::via_proxy(endpoint, ClientConfig::default()).unwrap();

        let err = client.get("http://example.com/").await.unwrap_err();
        assert_eq!(classify(&err), BlockingSignal::None);
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_blocking() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = TransportClient::system(ClientConfig::default());
        let err = client.get(&format!("http://127.0.0.1:{port}/")).await.unwrap_err();
        assert_eq!(classify(&err), BlockingSignal::None);
    }
}

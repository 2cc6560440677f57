//! Loopback fakes for tests
//!
//! - [`StaticResolver`]: scripted `Resolve` implementation with a call counter
//! - [`OriginServer`]: minimal HTTP/1.1 origin with per-host status overrides
//! - [`Socks5Relay`] / [`HttpProxy`]: relays that forward every tunnel to one
//!   upstream address, standing in for a proxy resolving the target remotely
//!
//! Every server listens on an ephemeral `127.0.0.1` port and stops when
//! dropped.

use crate::connect::{
    ADDR_DOMAIN, ADDR_IPV4, ADDR_IPV6, AUTH_NO_AUTH, CMD_CONNECT, REPLY_CONNECTION_REFUSED, REPLY_SUCCESS,
    SOCKS5_VERSION,
};
use crate::doh::{DohError, Resolve};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;


/// Resolver with a fixed answer
pub struct StaticResolver {
    name: String,
    answer: Option<Vec<IpAddr>>,
    calls: AtomicUsize,
}

impl StaticResolver {
    /// Every lookup fails with a `Lookup` error
    pub fn failing(name: &str) -> Self {
        Self {
            name: name.to_string(),
            answer: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every lookup returns `addresses` (an empty list means `NoAddresses`)
    pub fn answering(name: &str, addresses: Vec<IpAddr>) -> Self {
        Self {
            name: name.to_string(),
            answer: Some(addresses),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of lookups so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DohError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match &self.answer {
            None => Err(DohError::Lookup {
                provider: self.name.clone(),
                host: host.to_string(),
                reason: "scripted failure".to_string(),
            }),
            Some(addresses) if addresses.is_empty() => Err(DohError::NoAddresses {
                provider: self.name.clone(),
                host: host.to_string(),
            }),
            Some(addresses) => Ok(addresses.clone()),
        }
    }
}

/// A port on 127.0.0.1 with nothing listening
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

async fn bind_loopback() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Read up to and including the blank line ending a request head
async fn read_head(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

#[derive(Default)]
struct OriginState {
    body: String,
    requests: AtomicUsize,
    hosts: Mutex<Vec<String>>,
    redirects: Mutex<HashMap<String, String>>,
    host_status: Mutex<HashMap<String, u16>>,
}

/// Minimal HTTP/1.1 origin server
pub struct OriginServer {
    addr: SocketAddr,
    state: Arc<OriginState>,
    task: JoinHandle<()>,
}

impl OriginServer {
    /// Serve `body` as `text/html` for every path
    pub async fn start(body: &str) -> Self {
        let (listener, addr) = bind_loopback().await;
        let state = Arc::new(OriginState {
            body: body.to_string(),
            ..OriginState::default()
        });

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle(stream, &state).await {
                            debug!("Origin connection error: {}", e);
                        }
                    });
                }
            })
        };

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `http://{host}:{port}{path}` for a host that resolves to this server
    pub fn url(&self, host: &str, path: &str) -> String {
        format!("http://{}:{}{}", host, self.port(), path)
    }

    /// Answer `from` with a 302 to `to`
    pub fn redirect(&self, from: &str, to: &str) {
        self.state
            .redirects
            .lock()
            .expect("origin state")
            .insert(from.to_string(), to.to_string());
    }

    /// Answer requests for `host` with `status` and an empty body
    pub fn fail_host(&self, host: &str, status: u16) {
        self.state
            .host_status
            .lock()
            .expect("origin state")
            .insert(host.to_string(), status);
    }

    /// Requests served so far
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Host names (without port) of the requests served so far
    pub fn hosts(&self) -> Vec<String> {
        self.state.hosts.lock().expect("origin state").clone()
    }

    async fn handle(mut stream: TcpStream, state: &OriginState) -> std::io::Result<()> {
        let head = read_head(&mut stream).await?;
        state.requests.fetch_add(1, Ordering::SeqCst);

        let mut lines = head.lines();
        let target = lines
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/")
            .to_string();

        // Absolute form (plain HTTP through an HTTP proxy)
        let path = match target.strip_prefix("http://") {
            Some(rest) => rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".into()),
            None => target,
        };

        let host = lines
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.trim().rsplit_once(':').map_or(value.trim(), |(h, _)| h).to_string())
            .unwrap_or_default();
        state.hosts.lock().expect("origin state").push(host.clone());

        let redirect = state.redirects.lock().expect("origin state").get(&path).cloned();
        let status = state.host_status.lock().expect("origin state").get(&host).copied();

        let response = if let Some(location) = redirect {
            format!("HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        } else if let Some(status) = status {
            format!("HTTP/1.1 {status} Scripted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        } else {
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                state.body.len(),
                state.body
            )
        };

        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}

impl Drop for OriginServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct RelayState {
    connections: AtomicUsize,
    targets: Mutex<Vec<String>>,
}

/// SOCKS5 relay forwarding every CONNECT to one upstream address
pub struct Socks5Relay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl Socks5Relay {
    pub async fn start(upstream: SocketAddr) -> Self {
        let (listener, addr) = bind_loopback().await;
        let state = Arc::new(RelayState::default());

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    let state = Arc::clone(&state);
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        debug!("SOCKS5 connection from {}", peer);
                        if let Err(e) = Self::handle(stream, upstream, &state).await {
                            debug!("SOCKS5 relay error: {}", e);
                        }
                    });
                }
            })
        };

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// `host:port` destinations requested by clients
    pub fn targets(&self) -> Vec<String> {
        self.state.targets.lock().expect("relay state").clone()
    }

    async fn handle(mut stream: TcpStream, upstream: SocketAddr, state: &RelayState) -> std::io::Result<()> {
        // ===== SOCKS5 Handshake =====
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await?;

        if greeting[0] != SOCKS5_VERSION || !methods.contains(&AUTH_NO_AUTH) {
            stream.write_all(&[SOCKS5_VERSION, 0xFF]).await?;
            return Ok(());
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

        // ===== Connection Request =====
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[1] != CMD_CONNECT {
            return Ok(());
        }

        let host = match header[3] {
            ADDR_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                std::net::Ipv4Addr::from(ip).to_string()
            }
            ADDR_IPV6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                std::net::Ipv6Addr::from(ip).to_string()
            }
            ADDR_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                String::from_utf8_lossy(&domain).into_owned()
            }
            _ => return Ok(()),
        };
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;

        state
            .targets
            .lock()
            .expect("relay state")
            .push(format!("{}:{}", host, u16::from_be_bytes(port)));

        match TcpStream::connect(upstream).await {
            Ok(mut remote) => {
                stream
                    .write_all(&[SOCKS5_VERSION, REPLY_SUCCESS, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                    .await?;
                copy_bidirectional(&mut stream, &mut remote).await?;
            }
            Err(_) => {
                stream
                    .write_all(&[SOCKS5_VERSION, REPLY_CONNECTION_REFUSED, 0, ADDR_IPV4, 0, 0, 0, 0, 0, 0])
                    .await?;
            }
        }

        Ok(())
    }
}

impl Drop for Socks5Relay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// HTTP proxy forwarding CONNECT tunnels and absolute-form requests to one
/// upstream address
pub struct HttpProxy {
    addr: SocketAddr,
    state: Arc<RelayState>,
    task: JoinHandle<()>,
}

impl HttpProxy {
    pub async fn start(upstream: SocketAddr) -> Self {
        let (listener, addr) = bind_loopback().await;
        let state = Arc::new(RelayState::default());

        let task = {
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let state = Arc::clone(&state);
                    state.connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle(stream, upstream, &state).await {
                            debug!("HTTP proxy error: {}", e);
                        }
                    });
                }
            })
        };

        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Request lines received (`CONNECT host:port HTTP/1.1`, `GET http://… HTTP/1.1`)
    pub fn targets(&self) -> Vec<String> {
        self.state.targets.lock().expect("proxy state").clone()
    }

    async fn handle(mut stream: TcpStream, upstream: SocketAddr, state: &RelayState) -> std::io::Result<()> {
        let head = read_head(&mut stream).await?;
        let request_line = head.lines().next().unwrap_or_default().to_string();
        state.targets.lock().expect("proxy state").push(request_line.clone());

        let mut remote = TcpStream::connect(upstream).await?;

        if request_line.starts_with("CONNECT ") {
            stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        } else {
            remote.write_all(head.as_bytes()).await?;
        }

        copy_bidirectional(&mut stream, &mut remote).await?;
        Ok(())
    }
}

impl Drop for HttpProxy {
    fn drop(&mut self) {
        self.task.abort();
    }
}

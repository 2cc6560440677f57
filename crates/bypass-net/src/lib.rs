//! Bypass Network Layer
//!
//! Transport plumbing for fetching pages across a hostile network path.
//!
//! Architecture:
//! 1. Request comes in with a URL and a route (system DNS, DoH pool, or proxy)
//! 2. Hostname is resolved through the route (DoH providers in priority order)
//! 3. TCP connect, optionally tunnelled through SOCKS5 / HTTP CONNECT
//! 4. TLS handshake, HTTP/1.1 exchange, body read
//! 5. On failure, the error is classified into a blocking signal

mod classify;
mod client;
mod connect;
mod doh;
mod fallback;
mod proxy;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use classify::{classify, BlockingSignal};
pub use client::{parse_content_type, ClientConfig, Response, Route, RouteKind, TransportClient, TransportError};
pub use doh::{DohConfig, DohEndpoint, DohError, DohProvider, DohResolverPool, Resolve};
pub use fallback::{first_success, first_success_async, Exhausted};
pub use proxy::{ProxyClientFactory, ProxyEndpoint, ProxyError, ProxyKind};

pub use hyper::body::Bytes;

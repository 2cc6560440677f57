//! Failure Classification
//!
//! Maps a failed transport attempt onto the kind of network interference it
//! most likely indicates. The fetch pipeline uses the signal to decide
//! whether a bypass tier is worth trying.
//!
//! | Failure | Signal |
//! |---------|--------|
//! | DNS lookup / DoH pool exhausted | `NameResolutionBlocked` |
//! | TLS handshake or certificate | `TlsBlocked` |
//! | Connect / read timeout | `ConnectionBlocked` |
//! | Anything else | `None` |

use crate::client::TransportError;
use serde::{Deserialize, Serialize};
use std::io;

/// Why an attempt failed, as far as blocking is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockingSignal {
    /// Ordinary error, no evidence of blocking
    None,
    /// DNS hijacked or refused
    NameResolutionBlocked,
    /// Handshake reset or tampered (SNI filtering)
    TlsBlocked,
    /// Timed out, typical of IP-level blackholing
    ConnectionBlocked,
}

impl BlockingSignal {
    /// Does this signal justify a bypass attempt?
    pub fn is_blocking(&self) -> bool {
        !matches!(self, BlockingSignal::None)
    }

    /// Short machine-friendly name
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockingSignal::None => "none",
            BlockingSignal::NameResolutionBlocked => "name_resolution_blocked",
            BlockingSignal::TlsBlocked => "tls_blocked",
            BlockingSignal::ConnectionBlocked => "connection_blocked",
        }
    }
}

impl std::fmt::Display for BlockingSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a transport error. Total: unknown kinds map to `None`.
pub fn classify(error: &TransportError) -> BlockingSignal {
    match error {
        TransportError::NameResolution { .. } => BlockingSignal::NameResolutionBlocked,
        TransportError::Tls(_) => BlockingSignal::TlsBlocked,
        TransportError::ConnectTimeout(_) | TransportError::ReadTimeout(_) => {
            BlockingSignal::ConnectionBlocked
        }
        TransportError::Io(e) if e.kind() == io::ErrorKind::TimedOut => {
            BlockingSignal::ConnectionBlocked
        }
        TransportError::InvalidUrl(_)
        | TransportError::Proxy { .. }
        | TransportError::Http(_)
        | TransportError::TooManyRedirects(_)
        | TransportError::BodyTooLarge(_)
        | TransportError::Io(_) => BlockingSignal::None,
    }
}

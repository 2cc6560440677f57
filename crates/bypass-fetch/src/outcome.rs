//! Fetch outcomes and errors
//!
//! A fetch always ends in a structured outcome; nothing here panics on a
//! network failure. Failure messages tell "blocking detected, manual bypass
//! available" apart from an ordinary load failure.

use crate::session::Tier;
use bypass_net::{classify, BlockingSignal, Bytes, Response, TransportError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fetch errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("No URL provided")]
    NoUrlProvided,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Blocking detected ({signal}): {detail}")]
    BlockingDetected {
        signal: BlockingSignal,
        detail: String,
    },

    #[error("Network error: {0}")]
    UnclassifiedNetworkError(String),
}

impl FetchError {
    /// Wrap a transport failure according to its classification
    pub fn from_transport(error: &TransportError) -> Self {
        match classify(error) {
            BlockingSignal::None => match error {
                TransportError::InvalidUrl(url) => FetchError::InvalidUrl(url.clone()),
                other => FetchError::UnclassifiedNetworkError(other.to_string()),
            },
            signal => FetchError::BlockingDetected {
                signal,
                detail: error.to_string(),
            },
        }
    }

    /// A response that arrived but is not a 2xx
    pub fn from_status(response: &Response) -> Self {
        FetchError::UnclassifiedNetworkError(format!(
            "HTTP {} from {}",
            response.status, response.final_url
        ))
    }

    pub fn signal(&self) -> BlockingSignal {
        match self {
            FetchError::BlockingDetected { signal, .. } => *signal,
            _ => BlockingSignal::None,
        }
    }
}

/// Controls the caller should offer after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    /// Reset the session and load again
    Retry,
    /// Switch to a proxy candidate
    TryProxy,
    /// Switch to the fixed relay
    TryAlternative,
}

/// Result of a fetch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success {
        body: Bytes,
        /// Full Content-Type header (`text/html` if absent)
        content_type: String,
        final_url: String,
        /// Tier the content was fetched on
        tier: Tier,
    },
    Failure {
        is_blocking: bool,
        signal: BlockingSignal,
        message: String,
    },
    Cancelled,
}

impl FetchOutcome {
    pub(crate) fn success(response: Response, tier: Tier) -> Self {
        let content_type = response.content_type().unwrap_or("text/html").to_string();

        FetchOutcome::Success {
            body: response.body,
            content_type,
            final_url: response.final_url,
            tier,
        }
    }

    /// Terminal failure with a user-facing message
    pub(crate) fn failure(
        is_blocking: bool,
        signal: BlockingSignal,
        used_proxy: bool,
        host: &str,
        detail: &str,
    ) -> Self {
        let message = if !is_blocking {
            format!("Something went wrong loading the article. Please try again. ({detail})")
        } else if used_proxy {
            format!(
                "Unable to connect to {host} due to network restrictions. \
                 Proxy method failed, try the alternative method or check your connection. ({detail})"
            )
        } else {
            format!(
                "Unable to connect to {host} due to network restrictions. \
                 Network blocking detected, try the proxy bypass methods. ({detail})"
            )
        };

        FetchOutcome::Failure {
            is_blocking,
            signal,
            message,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, FetchOutcome::Failure { is_blocking: true, .. })
    }

    /// Body of a successful fetch
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            FetchOutcome::Success { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            FetchOutcome::Failure { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Controls to present: bypass options when blocking was seen, a plain
    /// retry otherwise.
    pub fn recovery_actions(&self) -> Vec<UserAction> {
        match self {
            FetchOutcome::Failure { is_blocking: true, .. } => {
                vec![UserAction::Retry, UserAction::TryProxy, UserAction::TryAlternative]
            }
            FetchOutcome::Failure { .. } => vec![UserAction::Retry],
            FetchOutcome::Success { .. } | FetchOutcome::Cancelled => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_transport() {
        let err = FetchError::from_transport(&TransportError::NameResolution {
            host: "freedium.cfd".into(),
            reason: "NXDOMAIN".into(),
        });
        assert_eq!(err.signal(), BlockingSignal::NameResolutionBlocked);
        assert!(matches!(err, FetchError::BlockingDetected { .. }));

        let err = FetchError::from_transport(&TransportError::ConnectTimeout(Duration::from_secs(10)));
        assert_eq!(err.signal(), BlockingSignal::ConnectionBlocked);

        let err = FetchError::from_transport(&TransportError::Http("reset".into()));
        assert!(matches!(err, FetchError::UnclassifiedNetworkError(_)));
        assert_eq!(err.signal(), BlockingSignal::None);

        let err = FetchError::from_transport(&TransportError::InvalidUrl("x".into()));
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }

    #[test]
    fn test_failure_messages() {
        let blocked = FetchOutcome::failure(true, BlockingSignal::TlsBlocked, false, "freedium.cfd", "reset");
        let proxied = FetchOutcome::failure(true, BlockingSignal::TlsBlocked, true, "freedium.cfd", "reset");
        let ordinary = FetchOutcome::failure(false, BlockingSignal::None, false, "freedium.cfd", "HTTP 500");

        assert!(blocked.message().unwrap().contains("Network blocking detected"));
        assert!(proxied.message().unwrap().contains("Proxy method failed"));
        assert!(ordinary.message().unwrap().starts_with("Something went wrong"));
        assert!(blocked.is_blocking());
        assert!(!ordinary.is_blocking());
    }

    #[test]
    fn test_recovery_actions() {
        let blocked = FetchOutcome::failure(true, BlockingSignal::TlsBlocked, false, "h", "d");
        assert_eq!(
            blocked.recovery_actions(),
            vec![UserAction::Retry, UserAction::TryProxy, UserAction::TryAlternative]
        );

        let ordinary = FetchOutcome::failure(false, BlockingSignal::None, false, "h", "d");
        assert_eq!(ordinary.recovery_actions(), vec![UserAction::Retry]);

        assert!(FetchOutcome::Cancelled.recovery_actions().is_empty());
    }
}

//! Escalation State Machine
//!
//! Per-request state deciding what to try after a failed attempt.
//!
//! ```text
//! DIRECT ──blocking──▶ DOH ──blocking──▶ PROXY ┄┄explicit┄┄▶ RELAY
//!                        │                 │
//!                        └────────┬────────┘
//!                                 ▼
//!                   mirror host (once) ──▶ FAILED
//! ```
//!
//! Mirror substitution is a flag, not a tier: it combines with whatever tier
//! is active. Each tier is tried at most once automatically; anything beyond
//! that is an explicit caller action.

use crate::config::FetchConfig;
use crate::outcome::FetchError;
use bypass_net::BlockingSignal;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

/// Transport tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// System DNS, no proxy
    Direct,
    /// DoH-resolved, no proxy
    Doh,
    /// Proxy candidate
    Proxy,
    /// Fixed last-resort relay
    Relay,
    /// Terminal
    Failed,
}

impl Tier {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Tier::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Direct => "direct",
            Tier::Doh => "doh",
            Tier::Proxy => "proxy",
            Tier::Relay => "relay",
            Tier::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded tier change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Tier,
    pub to: Tier,
    pub signal: BlockingSignal,
}

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Rebuild the client for `to` and retry
    Escalate { from: Tier, to: Tier },
    /// Retry on the same client against the mirror URL
    Mirror { target: String },
    /// Give up
    Fail {
        is_blocking: bool,
        signal: BlockingSignal,
    },
}

/// State of one fetch, owned by whoever drives it
#[derive(Debug, Clone)]
pub struct FetchSession {
    target: Url,
    original: String,
    primary_host: String,
    mirror_host: String,
    initial_tier: Tier,
    tier: Tier,
    proxy_attempts: u32,
    relay_attempted: bool,
    mirror_applied: bool,
    mirror_substitutions: u32,
    blocking_detected: bool,
    last_signal: Option<BlockingSignal>,
    transitions: Vec<Transition>,
}

impl FetchSession {
    /// Start a session for `target`. `original` is the pre-rewrite URL,
    /// kept for display and sharing.
    pub fn new(target: &str, original: &str, config: &FetchConfig) -> Result<Self, FetchError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(FetchError::NoUrlProvided);
        }

        let target = Url::parse(target).map_err(|e| FetchError::InvalidUrl(format!("{target}: {e}")))?;
        if target.host_str().is_none() {
            return Err(FetchError::InvalidUrl(format!("{target}: no host")));
        }

        Ok(Self {
            target,
            original: original.to_string(),
            primary_host: config.primary_host.to_ascii_lowercase(),
            mirror_host: config.mirror_host.to_ascii_lowercase(),
            initial_tier: config.initial_tier,
            tier: config.initial_tier,
            proxy_attempts: 0,
            relay_attempted: false,
            mirror_applied: false,
            mirror_substitutions: 0,
            blocking_detected: false,
            last_signal: None,
            transitions: Vec::new(),
        })
    }

    pub fn target(&self) -> &str {
        self.target.as_str()
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn proxy_attempts(&self) -> u32 {
        self.proxy_attempts
    }

    pub fn relay_attempted(&self) -> bool {
        self.relay_attempted
    }

    /// Automatic mirror substitutions so far (never more than one)
    pub fn mirror_substitutions(&self) -> u32 {
        self.mirror_substitutions
    }

    /// Sticky: set by the first blocking signal, cleared only by `reset`
    pub fn blocking_detected(&self) -> bool {
        self.blocking_detected
    }

    pub fn last_signal(&self) -> Option<BlockingSignal> {
        self.last_signal
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Has any proxy-backed tier been tried?
    pub fn used_proxy(&self) -> bool {
        self.proxy_attempts > 0 || self.relay_attempted
    }

    /// Decide what follows a failed attempt classified as `signal`
    pub fn on_failure(&mut self, signal: BlockingSignal, main_document: bool) -> Decision {
        if signal.is_blocking() {
            self.blocking_detected = true;
            self.last_signal = Some(signal);
        }

        if let Some(to) = self.escalation(signal) {
            let from = self.tier;
            self.transition(to, signal);
            if to == Tier::Proxy {
                self.proxy_attempts += 1;
            }
            return Decision::Escalate { from, to };
        }

        if main_document && !self.mirror_applied && self.on_host(&self.primary_host) {
            if let Some(target) = self.rewrite_host(&self.mirror_host.clone()) {
                self.mirror_applied = true;
                self.mirror_substitutions += 1;
                info!(
                    "Retrying on mirror {} (tier: {}, signal: {})",
                    target, self.tier, signal
                );
                return Decision::Mirror { target };
            }
        }

        self.transition(Tier::Failed, signal);
        Decision::Fail {
            is_blocking: self.blocking_detected,
            signal: self.last_signal.unwrap_or(signal),
        }
    }

    fn escalation(&self, signal: BlockingSignal) -> Option<Tier> {
        match (self.tier, signal) {
            (_, BlockingSignal::None) => None,
            (Tier::Direct, _) => Some(Tier::Doh),
            (Tier::Doh, BlockingSignal::NameResolutionBlocked) => Some(Tier::Proxy),
            (Tier::Doh, BlockingSignal::TlsBlocked | BlockingSignal::ConnectionBlocked)
                if self.proxy_attempts == 0 =>
            {
                Some(Tier::Proxy)
            }
            // Proxy → Relay only on request
            _ => None,
        }
    }

    /// Switch to a proxy candidate (the "try proxy" action)
    pub fn request_proxy(&mut self) {
        self.proxy_attempts += 1;
        self.transition(Tier::Proxy, self.last_signal.unwrap_or(BlockingSignal::None));
    }

    /// Switch to the fixed relay (the "try alternative" action)
    pub fn request_relay(&mut self) {
        self.relay_attempted = true;
        self.transition(Tier::Relay, self.last_signal.unwrap_or(BlockingSignal::None));
    }

    /// Start over on the initial tier with counters and blocking state cleared.
    /// The target stays as it is.
    pub fn reset(&mut self) {
        self.transition(self.initial_tier, BlockingSignal::None);
        self.proxy_attempts = 0;
        self.relay_attempted = false;
        self.blocking_detected = false;
        self.last_signal = None;
    }

    /// Swap the target between the primary and the mirror host.
    /// Returns the new target, or None if it is on neither.
    pub fn toggle_mirror(&mut self) -> Option<String> {
        let to = if self.on_host(&self.primary_host) {
            self.mirror_host.clone()
        } else if self.on_host(&self.mirror_host) {
            self.primary_host.clone()
        } else {
            return None;
        };

        let target = self.rewrite_host(&to)?;
        info!("Target switched to {}", target);
        Some(target)
    }

    fn on_host(&self, host: &str) -> bool {
        self.target
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(host))
    }

    fn rewrite_host(&mut self, host: &str) -> Option<String> {
        self.target.set_host(Some(host)).ok()?;
        Some(self.target.to_string())
    }

    fn transition(&mut self, to: Tier, signal: BlockingSignal) {
        let from = self.tier;
        if from == to {
            return;
        }

        info!("Tier {} -> {} (signal: {})", from, to, signal);
        self.tier = to;
        self.transitions.push(Transition { from, to, signal });
    }
}

//! Bypass Fetch - Blocking-Resilient Page Fetching
//!
//! Fetches a page across a network path that may tamper with DNS, filter
//! SNI or blackhole addresses, escalating through bypass tiers until one
//! works or the options run out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     FetchPipeline                        │
//! │                                                          │
//! │  FetchSession ──signal──▶ on_failure ──▶ Decision        │
//! │       │                                    │             │
//! │       ▼                                    ▼             │
//! │  ┌─────────┐   ┌─────────┐   ┌─────────┐   ┌─────────┐   │
//! │  │ DIRECT  │──▶│   DOH   │──▶│  PROXY  │┄┄▶│  RELAY  │   │
//! │  └─────────┘   └─────────┘   └─────────┘   └─────────┘   │
//! │                      + mirror host, at most once         │
//! └──────────────────────────────────────────────────────────┘
//!                             │
//!                             ▼
//!         bypass-net: DoH pool, proxy factory, transport
//! ```
//!
//! # Features
//!
//! - **Failure classification**: DNS, TLS and timeout failures count as
//!   blocking, everything else is an ordinary error
//! - **Sequential tiers**: no racing, so a success is attributable
//! - **Cancellation**: a `CancellationToken` interrupts in-flight requests
//! - **Intercept hook**: main documents on the content domains only

mod config;
mod intercept;
mod outcome;
mod pipeline;
mod session;

pub use config::{ConfigError, FetchConfig};
pub use intercept::{ContentInterceptor, InterceptResult, InterceptedResponse, ResourceType};
pub use outcome::{FetchError, FetchOutcome, UserAction};
pub use pipeline::FetchPipeline;
pub use session::{Decision, FetchSession, Tier, Transition};

pub use tokio_util::sync::CancellationToken;

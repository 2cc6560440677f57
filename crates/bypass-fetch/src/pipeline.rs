//! Fetch Pipeline
//!
//! Drives a [`FetchSession`] to an outcome:
//!
//! 1. Build the client for the session's tier
//! 2. Attempt the target URL
//! 3. On failure, classify and let the session decide
//!    (escalate, mirror retry, or fail)
//! 4. Escalation waits `escalation_delay`, then rebuilds the client
//!
//! Tiers are strictly sequential. Cancellation is checked between attempts
//! and raced against the in-flight request and the escalation delay.
//!
//! # Usage
//!
//! ```rust,ignore
//! let pipeline = Arc::new(FetchPipeline::new(FetchConfig::default())?);
//! let cancel = CancellationToken::new();
//!
//! let url = pipeline.config().content_url(article);
//! match pipeline.fetch(&url, article, &cancel).await {
//!     FetchOutcome::Success { body, .. } => render(body),
//!     failure => show(failure.recovery_actions()),
//! }
//! ```

use crate::config::{ConfigError, FetchConfig};
use crate::outcome::{FetchError, FetchOutcome};
use crate::session::{Decision, FetchSession, Tier};
use bypass_net::{
    BlockingSignal, ClientConfig, DohResolverPool, ProxyClientFactory, Response, TransportClient,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fetch orchestrator, one per process
pub struct FetchPipeline {
    config: FetchConfig,
    client_config: ClientConfig,
    /// Built on first use, read-only afterwards
    pool: OnceCell<Arc<DohResolverPool>>,
}

impl FetchPipeline {
    /// Pipeline whose DoH pool is built from `config` on first use.
    /// Fails if `config` does not validate.
    pub fn new(config: FetchConfig) -> Result<Self, ConfigError> {
        Self::with_pool_cell(config, OnceCell::new())
    }

    /// Pipeline over an already-built resolver pool
    pub fn with_resolver_pool(config: FetchConfig, pool: DohResolverPool) -> Result<Self, ConfigError> {
        Self::with_pool_cell(config, OnceCell::from(Arc::new(pool)))
    }

    fn with_pool_cell(config: FetchConfig, pool: OnceCell<Arc<DohResolverPool>>) -> Result<Self, ConfigError> {
        config.validate()?;
        let client_config = config.client_config();

        Ok(Self {
            config,
            client_config,
            pool,
        })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Shared DoH pool, built once
    pub async fn resolver_pool(&self) -> Arc<DohResolverPool> {
        self.pool
            .get_or_init(|| async {
                info!("Building DoH resolver pool ({} endpoints)", self.config.doh_providers.len());
                Arc::new(DohResolverPool::build(&self.config.doh_providers, &self.config.doh_config()).await)
            })
            .await
            .clone()
    }

    /// Start a session with the configured initial tier
    pub fn session(&self, target: &str, original: &str) -> Result<FetchSession, FetchError> {
        FetchSession::new(target, original, &self.config)
    }

    /// Fresh client for `tier` (None for `Failed`)
    pub async fn client_for(&self, tier: Tier) -> Option<TransportClient> {
        let client = match tier {
            Tier::Direct => TransportClient::system(self.client_config.clone()),
            Tier::Doh => DohResolverPool::build_client(&self.resolver_pool().await, &self.client_config),
            Tier::Proxy => self.proxy_factory().await.build_client(),
            Tier::Relay => self.proxy_factory().await.build_relay_client(&self.config.relay),
            Tier::Failed => return None,
        };
        Some(client)
    }

    async fn proxy_factory(&self) -> ProxyClientFactory {
        ProxyClientFactory::new(
            self.config.proxies.clone(),
            self.client_config.clone(),
            self.resolver_pool().await,
        )
    }

    /// One fetch from scratch
    pub async fn fetch(&self, target: &str, original: &str, cancel: &CancellationToken) -> FetchOutcome {
        match self.session(target, original) {
            Ok(mut session) => self.run(&mut session, cancel).await,
            Err(e) => {
                warn!("Cannot start fetch: {}", e);
                FetchOutcome::failure(false, BlockingSignal::None, false, &self.config.primary_host, &e.to_string())
            }
        }
    }

    /// Hand a fetch off to a background task
    pub fn spawn_fetch(
        self: &Arc<Self>,
        target: String,
        original: String,
        cancel: CancellationToken,
    ) -> JoinHandle<FetchOutcome> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.fetch(&target, &original, &cancel).await })
    }

    /// Drive `session` until success, terminal failure or cancellation.
    ///
    /// Can be called again after an explicit session action
    /// (`request_proxy`, `request_relay`, `reset`).
    pub async fn run(&self, session: &mut FetchSession, cancel: &CancellationToken) -> FetchOutcome {
        if session.tier().is_terminal() {
            return self.terminal(session, "session already failed");
        }

        // The first client may have to build the DoH pool
        let built = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Fetch cancelled while preparing {}", session.tier());
                return FetchOutcome::Cancelled;
            }
            client = self.client_for(session.tier()) => client,
        };
        let Some(mut client) = built else {
            return self.terminal(session, "session already failed");
        };

        loop {
            if cancel.is_cancelled() {
                info!("Fetch cancelled before attempt on {}", session.tier());
                return FetchOutcome::Cancelled;
            }

            let url = session.target().to_string();
            debug!("Attempt {} on {} via {}", url, session.tier(), client.route());

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Fetch cancelled during attempt on {}", session.tier());
                    return FetchOutcome::Cancelled;
                }
                result = Self::attempt(&client, &url) => result,
            };

            let error = match result {
                Ok(response) => {
                    info!(
                        "Fetched {} on {} ({} bytes, {} transitions)",
                        response.final_url,
                        session.tier(),
                        response.body.len(),
                        session.transitions().len()
                    );
                    return FetchOutcome::success(response, session.tier());
                }
                Err(e) => e,
            };

            let signal = error.signal();
            warn!("Attempt on {} failed ({}): {}", session.tier(), signal, error);

            match session.on_failure(signal, true) {
                Decision::Escalate { to, .. } => {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("Fetch cancelled before retry on {}", to);
                            return FetchOutcome::Cancelled;
                        }
                        next = async {
                            tokio::time::sleep(self.config.escalation_delay()).await;
                            self.client_for(to).await
                        } => next,
                    };

                    match next {
                        Some(next) => client = next,
                        None => return self.terminal(session, &error.to_string()),
                    }
                }
                // Same tier, same client
                Decision::Mirror { .. } => {}
                Decision::Fail { is_blocking, signal } => {
                    return FetchOutcome::failure(
                        is_blocking,
                        signal,
                        session.used_proxy(),
                        &self.config.primary_host,
                        &error.to_string(),
                    );
                }
            }
        }
    }

    async fn attempt(client: &TransportClient, url: &str) -> Result<Response, FetchError> {
        let response = client.get(url).await.map_err(|e| FetchError::from_transport(&e))?;

        if !response.is_success() {
            return Err(FetchError::from_status(&response));
        }
        Ok(response)
    }

    fn terminal(&self, session: &FetchSession, detail: &str) -> FetchOutcome {
        FetchOutcome::failure(
            session.blocking_detected(),
            session.last_signal().unwrap_or(BlockingSignal::None),
            session.used_proxy(),
            &self.config.primary_host,
            detail,
        )
    }
}

impl std::fmt::Debug for FetchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchPipeline")
            .field("primary_host", &self.config.primary_host)
            .field("initial_tier", &self.config.initial_tier)
            .field("pool", &self.pool.get())
            .finish()
    }
}

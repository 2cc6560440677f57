//! Content Interceptor
//!
//! Hook for a rendering layer: main-document loads on the content domains
//! are served through the fetch pipeline, everything else falls through to
//! the renderer's own networking.
//!
//! Flow:
//! 1. Renderer asks to load a URL with a resource type
//! 2. Not a document, or not a content host → `PassThrough`
//! 3. Otherwise run a fetch session → `Served` or `Failed`

use crate::outcome::FetchOutcome;
use crate::pipeline::FetchPipeline;
use bypass_net::{parse_content_type, Bytes};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

/// Type of resource being requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceType {
    /// Main document
    Document,
    /// CSS stylesheet
    Stylesheet,
    /// JavaScript
    Script,
    /// Image
    Image,
    /// Font
    Font,
    /// XHR/Fetch request
    XmlHttpRequest,
    /// Media (video/audio)
    Media,
    /// Other/Unknown
    Other,
}

impl ResourceType {
    /// Guess from the Accept header, falling back to the path extension
    pub fn from_accept_or_path(accept: Option<&str>, path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path).to_ascii_lowercase();
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");

        match ext {
            "js" | "mjs" => return Self::Script,
            "css" => return Self::Stylesheet,
            "woff" | "woff2" | "ttf" | "otf" => return Self::Font,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" => return Self::Image,
            "mp4" | "webm" | "mp3" | "ogg" => return Self::Media,
            _ => {}
        }

        if let Some(accept) = accept {
            if accept.contains("text/html") { return Self::Document; }
            if accept.contains("text/css") { return Self::Stylesheet; }
            if accept.contains("javascript") { return Self::Script; }
            if accept.contains("image/") { return Self::Image; }
            if accept.contains("font/") { return Self::Font; }
            if accept.contains("application/json") { return Self::XmlHttpRequest; }
        }

        Self::Other
    }
}

/// Raw response handed back to the renderer
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    /// Content type without parameters
    pub mime_type: String,
    /// Charset parameter (`utf-8` if absent)
    pub charset: String,
    pub body: Bytes,
    pub final_url: String,
}

impl InterceptedResponse {
    fn from_content_type(content_type: &str, body: Bytes, final_url: String) -> Self {
        let (mime_type, charset) = parse_content_type(content_type);

        Self {
            mime_type: mime_type.unwrap_or_else(|| "text/html".to_string()),
            charset: charset.unwrap_or_else(|| "utf-8".to_string()),
            body,
            final_url,
        }
    }
}

/// Result of an interception
#[derive(Debug, Clone)]
pub enum InterceptResult {
    /// Fetched through the pipeline
    Served(InterceptedResponse),
    /// Not ours, renderer loads it normally
    PassThrough,
    /// Fetched through the pipeline and failed (or was cancelled)
    Failed(FetchOutcome),
}

impl InterceptResult {
    /// The response to hand to the renderer, if any
    pub fn into_response(self) -> Option<InterceptedResponse> {
        match self {
            InterceptResult::Served(response) => Some(response),
            _ => None,
        }
    }
}

/// Interception statistics
#[derive(Debug, Default)]
pub struct InterceptorStats {
    pub intercepted: AtomicU64,
    pub served: AtomicU64,
    pub passed_through: AtomicU64,
}

/// Routes main-document loads on the content domains through the pipeline
pub struct ContentInterceptor {
    pipeline: Arc<FetchPipeline>,
    stats: InterceptorStats,
}

impl ContentInterceptor {
    pub fn new(pipeline: Arc<FetchPipeline>) -> Self {
        Self {
            pipeline,
            stats: InterceptorStats::default(),
        }
    }

    /// Would this load be intercepted?
    pub fn should_intercept(&self, url: &str, resource_type: ResourceType) -> bool {
        resource_type == ResourceType::Document
            && Url::parse(url)
                .ok()
                .and_then(|u| u.host_str().map(|h| self.pipeline.config().is_content_host(h)))
                .unwrap_or(false)
    }

    pub async fn intercept_resource_load(
        &self,
        url: &str,
        resource_type: ResourceType,
        cancel: &CancellationToken,
    ) -> InterceptResult {
        if !self.should_intercept(url, resource_type) {
            trace!("Pass through {:?} {}", resource_type, url);
            self.stats.passed_through.fetch_add(1, Ordering::Relaxed);
            return InterceptResult::PassThrough;
        }

        debug!("Intercepting document load {}", url);
        self.stats.intercepted.fetch_add(1, Ordering::Relaxed);

        match self.pipeline.fetch(url, url, cancel).await {
            FetchOutcome::Success { body, content_type, final_url, .. } => {
                self.stats.served.fetch_add(1, Ordering::Relaxed);
                InterceptResult::Served(InterceptedResponse::from_content_type(&content_type, body, final_url))
            }
            outcome => InterceptResult::Failed(outcome),
        }
    }

    /// (intercepted, served, passed through)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.intercepted.load(Ordering::Relaxed),
            self.stats.served.load(Ordering::Relaxed),
            self.stats.passed_through.load(Ordering::Relaxed),
        )
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::debug;
use url::Url;

use crate::settings::{AppConfig, FetchMode};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("render service error: {0}")]
    Render(String),

    #[error("render service returned no content")]
    EmptyRender,
}

/// Retrieves the markup of a page.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError>;
}

// ── Plain HTTP ──

/// Fast path for pages whose listings are in the served markup.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        let start = Instant::now();
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.text().await?;
        debug!(%url, bytes = body.len(), latency_ms = start.elapsed().as_millis() as u64, "Fetched");
        Ok(body)
    }
}

// ── Rendered (spider.cloud) ──

/// Slow path: the page is loaded in a headless browser by spider.cloud and the
/// resulting DOM is returned as raw HTML.
pub struct RenderFetcher {
    spider: Spider,
    user_agent: String,
}

impl RenderFetcher {
    pub fn new(api_key: String, user_agent: &str) -> Result<Self> {
        let spider = Spider::new(Some(api_key))
            .map_err(|e| anyhow!("Failed to create Spider client: {}", e))?;
        Ok(Self {
            spider,
            user_agent: user_agent.to_string(),
        })
    }

    fn params(&self) -> RequestParams {
        RequestParams {
            request: Some(RequestType::Chrome),
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PageFetcher for RenderFetcher {
    async fn fetch(&self, url: &Url) -> Result<String, FetchError> {
        let start = Instant::now();
        let response = self
            .spider
            .scrape_url(url.as_str(), Some(self.params()), "application/json")
            .await
            .map_err(|e| FetchError::Render(e.to_string()))?;

        let html = parse_render_response(response)?;
        debug!(%url, bytes = html.len(), latency_ms = start.elapsed().as_millis() as u64, "Rendered");
        Ok(html)
    }
}

/// spider.cloud answers with `[{ "content": ..., "status": ..., "error": ... }]`,
/// sometimes wrapped in a JSON string.
fn parse_render_response(value: serde_json::Value) -> Result<String, FetchError> {
    let parsed: serde_json::Value = match value.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(value.clone()),
        None => value,
    };

    let first = parsed.as_array().and_then(|arr| arr.first());

    if let Some(status) = first
        .and_then(|obj| obj.get("status"))
        .and_then(|s| s.as_u64())
    {
        if !(200..300).contains(&status) {
            return Err(FetchError::Status(status as u16));
        }
    }

    if let Some(err) = first
        .and_then(|obj| obj.get("error"))
        .and_then(|e| e.as_str())
        .filter(|e| !e.is_empty())
    {
        return Err(FetchError::Render(err.to_string()));
    }

    first
        .and_then(|obj| obj.get("content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .map(str::to_string)
        .ok_or(FetchError::EmptyRender)
}

// ── Selection ──

/// Both fetch capabilities, picked per target by its fetch mode.
#[derive(Clone)]
pub struct Fetchers {
    http: Arc<dyn PageFetcher>,
    render: Option<Arc<dyn PageFetcher>>,
}

impl Fetchers {
    pub fn new(http: Arc<dyn PageFetcher>, render: Option<Arc<dyn PageFetcher>>) -> Self {
        Self { http, render }
    }

    /// Build the fetchers the configured targets need. The render client is
    /// only created when at least one target asks for it.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let http = HttpFetcher::new(
            &cfg.http.user_agent,
            Duration::from_secs(cfg.http.timeout_secs),
        )?;

        let render = if cfg.needs_render() {
            let key = cfg
                .render
                .resolve_api_key()
                .ok_or_else(|| anyhow!("SPIDER_API_KEY must be set for render targets"))?;
            Some(Arc::new(RenderFetcher::new(key, &cfg.http.user_agent)?) as Arc<dyn PageFetcher>)
        } else {
            None
        };

        Ok(Self::new(Arc::new(http), render))
    }

    pub fn for_mode(&self, mode: FetchMode) -> Result<&dyn PageFetcher, FetchError> {
        match mode {
            FetchMode::Http => Ok(self.http.as_ref()),
            FetchMode::Render => self
                .render
                .as_deref()
                .ok_or_else(|| FetchError::Render("render fetcher not configured".into())),
        }
    }
}

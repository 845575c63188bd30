//! HTTP implementation of the fetch capability
//!
//! Downloads the CSV export of a series and, when enabled, scrapes the
//! series page for descriptive metadata. Pacing and concurrency belong to
//! the fetch coordinator; this client only maps transport outcomes onto
//! `FetchError`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Client, Response};
use scraper::{ElementRef, Html, Selector};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::domain::{EntityFetcher, EntityId, EntityMetadata, FetchError, FetchedEntity, RawPayload};
use crate::infrastructure::config::FetchConfig;

const BLOCK_MARKERS: [&str; 2] = ["Access Denied", "You don't have permission to access"];

lazy_static::lazy_static! {
    static ref TITLE_SELECTOR: Selector = Selector::parse("h1.series-title, .series-title").expect("valid selector");
    static ref META_LABEL_SELECTOR: Selector = Selector::parse("span.series-meta-label").expect("valid selector");
}

pub struct HttpEntityFetcher {
    client: Client,
    base_url: Url,
    timeout: Duration,
    fetch_metadata: bool,
}

impl HttpEntityFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).context("Invalid user agent")?,
        );

        let timeout = Duration::from_secs(config.timeout_secs);
        let mut builder = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy).with_context(|| format!("Invalid proxy: {proxy}"))?);
            debug!("Using proxy {}", proxy);
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        let mut base_url =
            Url::parse(&config.base_url).with_context(|| format!("Invalid base URL: {}", config.base_url))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            client,
            base_url,
            timeout,
            fetch_metadata: config.fetch_metadata,
        })
    }

    pub fn csv_url(&self, entity_id: &EntityId) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join("graph/fredgraph.csv")
            .map_err(|e| FetchError::Rejected { status: 0, message: e.to_string() })?;
        url.query_pairs_mut().append_pair("id", entity_id.as_str());
        Ok(url)
    }

    pub fn series_page_url(&self, entity_id: &EntityId) -> Result<Url, FetchError> {
        self.base_url
            .join("series/")
            .and_then(|series| series.join(entity_id.as_str()))
            .map_err(|e| FetchError::Rejected { status: 0, message: e.to_string() })
    }

    async fn get_text(&self, url: Url) -> Result<(String, Option<String>), FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if let Some(err) = status_error(&response) {
            debug!("❌ {} answered {}", url, response.status());
            return Err(err);
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| self.transport_error(&e))?;

        if let Some(marker) = blocked_marker(&body) {
            return Err(FetchError::Blocked(marker.to_string()));
        }

        Ok((body, content_type))
    }

    fn transport_error(&self, err: &reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Network(err.to_string())
        }
    }

    /// Time left for the metadata page once the CSV is in hand
    ///
    /// The whole fetch has to fit inside one attempt timeout, minus a margin
    /// for the caller's own timer.
    fn metadata_budget(&self, started: Instant) -> Duration {
        self.timeout
            .saturating_sub(started.elapsed())
            .saturating_sub(self.timeout / 10)
    }

    /// Best effort: a failed or slow metadata page never fails the fetch
    async fn fetch_metadata(&self, entity_id: &EntityId, budget: Duration) -> EntityMetadata {
        if budget.is_zero() {
            debug!("No time left for metadata of {}", entity_id);
            return EntityMetadata::default();
        }
        match tokio::time::timeout(budget, self.fetch_metadata_page(entity_id)).await {
            Ok(metadata) => metadata,
            Err(_) => {
                warn!("⚠️ Metadata for {} skipped: no answer within {:?}", entity_id, budget);
                EntityMetadata::default()
            }
        }
    }

    async fn fetch_metadata_page(&self, entity_id: &EntityId) -> EntityMetadata {
        let url = match self.series_page_url(entity_id) {
            Ok(url) => url,
            Err(e) => {
                warn!("Metadata URL for {} is invalid: {}", entity_id, e);
                return EntityMetadata::default();
            }
        };

        match self.get_text(url).await {
            Ok((html, _)) => parse_metadata(&html),
            Err(e) => {
                warn!("⚠️ Metadata for {} unavailable: {}", entity_id, e);
                EntityMetadata::default()
            }
        }
    }
}

#[async_trait]
impl EntityFetcher for HttpEntityFetcher {
    async fn fetch(&self, entity_id: &EntityId) -> Result<FetchedEntity, FetchError> {
        let started = Instant::now();
        let (body, content_type) = self.get_text(self.csv_url(entity_id)?).await?;
        let mut payload = RawPayload::new(body);
        if let Some(content_type) = content_type {
            payload = payload.with_content_type(content_type);
        }
        debug!("Fetched {} ({} bytes)", entity_id, payload.len());

        let mut fetched = FetchedEntity::new(payload);
        if self.fetch_metadata {
            let budget = self.metadata_budget(started);
            fetched = fetched.with_metadata(self.fetch_metadata(entity_id, budget).await);
        }
        Ok(fetched)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn status_error(response: &Response) -> Option<FetchError> {
    let status = response.status();
    let err = FetchError::from_status(status.as_u16(), status.canonical_reason().unwrap_or("unknown status"))?;

    Some(match err {
        FetchError::RateLimited { .. } => FetchError::RateLimited {
            retry_after: response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after),
        },
        other => other,
    })
}

/// Delta-seconds form of `Retry-After`; HTTP dates are ignored
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// A 200 response whose body is actually a block page
pub fn blocked_marker(body: &str) -> Option<&'static str> {
    BLOCK_MARKERS.into_iter().find(|marker| body.contains(marker))
}

/// Pull the title and labelled metadata values out of a series page
pub fn parse_metadata(html: &str) -> EntityMetadata {
    let document = Html::parse_document(html);
    let mut metadata = EntityMetadata {
        title: document
            .select(&TITLE_SELECTOR)
            .next()
            .map(|el| element_text(&el))
            .filter(|t| !t.is_empty()),
        ..EntityMetadata::default()
    };

    for label in document.select(&META_LABEL_SELECTOR) {
        let Some(value) = label
            .next_siblings()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().classes().any(|c| c == "series-meta-value"))
            .map(|el| element_text(&el))
            .filter(|v| !v.is_empty())
        else {
            continue;
        };

        let label = element_text(&label).to_lowercase();
        let slot = if label.contains("frequency") {
            &mut metadata.frequency
        } else if label.contains("units") {
            &mut metadata.units
        } else if label.contains("adjustment") {
            &mut metadata.seasonal_adjustment
        } else if label.contains("updated") {
            &mut metadata.upstream_updated
        } else {
            continue;
        };
        slot.get_or_insert(value);
    }

    metadata
}

fn element_text(el: &ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

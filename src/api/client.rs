use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::rate_limiter::{RequestThrottle, ThrottleConfig, ThrottleStats};
use super::retry::{Backoff, RetryPolicy};
use super::sources::ListingSource;
use super::types::{FetchError, ListingQuery, RawListing};

/// Longest error body echoed into a `Rejected` message.
const MAX_ERROR_BODY: usize = 200;

/// Anything that can produce the listings for one query.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ListingFetcher: Send + Sync {
    async fn fetch(&self, query: &ListingQuery) -> Result<Vec<RawListing>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchClientConfig {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub throttle: ThrottleConfig,
}

impl Default for FetchClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            throttle: ThrottleConfig::default(),
        }
    }
}

/// One failed attempt, with the server's requested wait if it sent one.
struct AttemptError {
    error: FetchError,
    retry_after: Option<Duration>,
}

impl From<FetchError> for AttemptError {
    fn from(error: FetchError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

pub struct FetchClient {
    http: Client,
    sources: HashMap<String, Arc<dyn ListingSource>>,
    throttle: RequestThrottle,
    retry: RetryPolicy,
}

impl FetchClient {
    pub fn new(config: FetchClientConfig, sources: Vec<Arc<dyn ListingSource>>) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let sources = sources
            .into_iter()
            .map(|source| (source.id().to_string(), source))
            .collect::<HashMap<_, _>>();

        info!(
            "🌐 Fetch client ready: {} sources, {} retries, {:?} min spacing",
            sources.len(),
            config.retry.max_retries,
            config.throttle.min_interval
        );

        Ok(Self {
            http,
            sources,
            throttle: RequestThrottle::new(config.throttle),
            retry: config.retry,
        })
    }

    /// Fetch every page of one query. Any failed page fails the whole query:
    /// a truncated listing set would read as delistings downstream.
    pub async fn fetch(&self, query: &ListingQuery) -> Result<Vec<RawListing>, FetchError> {
        query.validate()?;

        let source = self
            .sources
            .get(&query.source)
            .ok_or_else(|| FetchError::Rejected(format!("unknown source {}", query.source)))?
            .clone();

        let mut listings = Vec::new();
        let max_pages = source.max_pages(query).min(query.max_pages);

        for page in 0..max_pages {
            let body = self.request_with_retry(source.as_ref(), query, page).await?;
            let parsed = source.parse_page(body)?;

            debug!(
                "📄 {} page {}: {} records, {} usable",
                query.label(),
                page,
                parsed.raw_count,
                parsed.listings.len()
            );

            let raw_count = parsed.raw_count;
            listings.extend(parsed.listings);

            if raw_count < query.page_size as usize {
                info!("✅ {} returned {} listings", query.label(), listings.len());
                return Ok(listings);
            }
        }

        // Last permitted page was full: more listings may exist past the cap
        warn!(
            "🛑 {} still full after {} pages of {}, refusing a truncated result",
            query.label(),
            max_pages,
            query.page_size
        );
        Err(FetchError::Malformed(format!(
            "result set exceeds {} pages × {} listings",
            max_pages, query.page_size
        )))
    }

    pub fn throttle_stats(&self) -> ThrottleStats {
        self.throttle.get_stats()
    }

    async fn request_with_retry(
        &self,
        source: &dyn ListingSource,
        query: &ListingQuery,
        page: u32,
    ) -> Result<Value, FetchError> {
        let mut backoff = Backoff::new(&self.retry);

        loop {
            self.throttle.acquire().await;

            let failure = match self.send_once(source, query, page).await {
                Ok(body) => return Ok(body),
                Err(failure) => failure,
            };

            if !failure.error.is_transient() {
                warn!("❌ {} page {}: {}", query.label(), page, failure.error);
                return Err(failure.error);
            }

            match backoff.next() {
                Some(delay) => {
                    let delay = match failure.retry_after {
                        Some(requested) => backoff.clamp(requested.max(delay)),
                        None => delay,
                    };
                    warn!(
                        "⏳ {} page {} attempt {} failed ({}), retrying in {:?}",
                        query.label(),
                        page,
                        backoff.attempts() - 1,
                        failure.error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(
                        "🛑 {} page {}: giving up after {} attempts",
                        query.label(),
                        page,
                        backoff.attempts()
                    );
                    return Err(FetchError::Exhausted {
                        attempts: backoff.attempts(),
                        last: failure.error.to_string(),
                    });
                }
            }
        }
    }

    async fn send_once(
        &self,
        source: &dyn ListingSource,
        query: &ListingQuery,
        page: u32,
    ) -> Result<Value, AttemptError> {
        let response = source
            .build_request(&self.http, query, page)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AttemptError {
                retry_after: retry_after(&response),
                error: FetchError::Transient(format!("HTTP {}", status)),
            });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(FetchError::Rejected(format!("HTTP {} - {}", status, body)).into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(format!("body read failed: {}", e)))?;

        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Malformed(format!("invalid JSON: {}", e)).into())
    }
}

#[async_trait]
impl ListingFetcher for FetchClient {
    async fn fetch(&self, query: &ListingQuery) -> Result<Vec<RawListing>, FetchError> {
        FetchClient::fetch(self, query).await
    }
}

fn classify_transport_error(e: reqwest::Error) -> AttemptError {
    if e.is_builder() {
        FetchError::Rejected(format!("invalid request: {}", e)).into()
    } else {
        // Timeouts, refused connections and dropped streams can all succeed later
        FetchError::Transient(e.to_string()).into()
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

//! Keyed persistence + HTTP fetch utilities for imcache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

use ratelimit::TokenBucket;

mod memory;
mod postgres;
mod ratelimit;
mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use ratelimit::RateLimit;
pub use store::{LayerSearch, Store, StoreError};

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Keyed by source id; sources without an entry are not rate limited.
    pub source_rate_limits: HashMap<String, RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 4,
            per_source_concurrency: 1,
            source_rate_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Transport-level failure. The fetcher never retries; callers decide.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            FetchError::Closed => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request { source, .. } if source.is_timeout())
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    rate_limits: HashMap<String, TokenBucket>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let rate_limits = config
            .source_rate_limits
            .into_iter()
            .map(|(source_id, limit)| (source_id, TokenBucket::new(limit)))
            .collect();

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            rate_limits,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Single GET with the configured timeout. Non-2xx statuses are errors.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = self.rate_limits.get(source_id) {
            bucket.acquire().await;
        }

        let span = info_span!("http_fetch", source_id, url);
        async {
            let resp = self
                .client
                .get(url)
                .query(query)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|source| FetchError::Request {
                    url: final_url.clone(),
                    source,
                })?
                .to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// HEAD probe following redirects; returns the final status.
    pub async fn head_status(&self, source_id: &str, url: &str) -> Result<StatusCode, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = self.rate_limits.get(source_id) {
            bucket.acquire().await;
        }

        self.client
            .head(url)
            .send()
            .instrument(info_span!("http_head", source_id, url))
            .await
            .map(|resp| resp.status())
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_errors_expose_their_status() {
        let err = FetchError::HttpStatus {
            status: 503,
            url: "https://example.invalid/apod".into(),
        };
        assert_eq!(err.status(), Some(503));
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "http status 503 for https://example.invalid/apod");
    }

    #[test]
    fn default_client_config_uses_bounded_timeout() {
        let config = HttpClientConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert!(HttpFetcher::new(config).is_ok());
    }

    #[test]
    fn rate_limits_attach_only_to_their_source() {
        let mut config = HttpClientConfig::default();
        config
            .source_rate_limits
            .insert("nasa-apod".into(), RateLimit::per_minute(30).unwrap());
        let fetcher = HttpFetcher::new(config).unwrap();
        assert!(fetcher.rate_limits.contains_key("nasa-apod"));
        assert!(!fetcher.rate_limits.contains_key("gibs-capabilities"));
    }
}

//! HTTP access to the survey-collection API: retrying fetches, pagination and form definitions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use toolscope_core::FormPage;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "toolscope-provider";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub api_token: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub max_pages: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            api_token: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
            max_pages: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("gave up after {max_pages} pages starting at {url}")]
    TooManyPages { url: String, max_pages: usize },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        if let Some(token) = &config.api_token {
            let mut headers = HeaderMap::new();
            let mut value = HeaderValue::from_str(&format!("Token {token}"))
                .context("API token contains characters not allowed in a header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self.fetch_bytes(url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: response.final_url,
            source,
        })
    }
}

/// Client for the form data and form definition endpoints of the collection API.
#[derive(Debug)]
pub struct FormApiClient {
    base_url: String,
    fetcher: HttpFetcher,
    max_pages: usize,
}

impl FormApiClient {
    pub fn new(base_url: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        anyhow::ensure!(!base_url.is_empty(), "form API base URL is empty");
        Ok(Self {
            base_url,
            fetcher: HttpFetcher::new(config)?,
            max_pages: config.max_pages.max(1),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn data_url(&self, form_id: &str) -> String {
        format!("{}/api/v2/assets/{}/data/?format=json", self.base_url, form_id)
    }

    pub fn asset_url(&self, form_id: &str) -> String {
        format!("{}/api/v2/assets/{}/?format=json", self.base_url, form_id)
    }

    pub async fn fetch_page(&self, url: &str) -> Result<FormPage, FetchError> {
        self.fetcher.fetch_json(url).await
    }

    /// Fetch every page of a form's submissions, following `next` links.
    pub async fn fetch_form(&self, form_id: &str) -> Result<FormPage, FetchError> {
        let first_url = self.data_url(form_id);
        let mut merged = self.fetch_page(&first_url).await?;
        let mut next = merged.next.take();
        let mut pages = 1;

        while let Some(url) = next {
            if pages >= self.max_pages {
                return Err(FetchError::TooManyPages {
                    url: first_url,
                    max_pages: self.max_pages,
                });
            }
            let page = self.fetch_page(&url).await?;
            merged.results.extend(page.results);
            next = page.next;
            pages += 1;
        }

        merged.previous = None;
        debug!(form_id, pages, records = merged.results.len(), "fetched form data");
        Ok(merged)
    }

    /// Raw form definition document, including its `content.survey` and `content.choices` tables.
    pub async fn fetch_asset(&self, form_id: &str) -> Result<JsonValue, FetchError> {
        self.fetcher.fetch_json(&self.asset_url(form_id)).await
    }
}

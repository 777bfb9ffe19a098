//! JSON document persistence + shared HTTP fetch utilities.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spf_core::Listing;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spf-storage";

/// Longest description kept in the properties export.
pub const EXPORT_DESCRIPTION_CHARS: usize = 500;

/// Top-level properties document consumed by the static frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertiesExport {
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub max_price: f64,
    #[serde(default)]
    pub total_count: usize,
    #[serde(default)]
    pub properties: Vec<Listing>,
}

impl PropertiesExport {
    pub fn new(
        generated_at: DateTime<Utc>,
        locations: Vec<String>,
        max_price: f64,
        mut properties: Vec<Listing>,
    ) -> Self {
        for listing in &mut properties {
            truncate_chars(&mut listing.description, EXPORT_DESCRIPTION_CHARS);
            listing.ensure_price_display();
        }
        Self {
            last_updated: generated_at,
            locations,
            max_price,
            total_count: properties.len(),
            properties,
        }
    }

    /// Re-stamps the document after an in-place rewrite of `properties`.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = at;
        self.total_count = self.properties.len();
    }
}

fn truncate_chars(text: &mut String, max_chars: usize) {
    if let Some((byte_idx, _)) = text.char_indices().nth(max_chars) {
        text.truncate(byte_idx);
    }
}

/// Reads a JSON document. A missing file is `Ok(None)`; unreadable or malformed
/// content is an error so callers can decide whether to start fresh.
pub async fn read_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<Option<T>> {
    let path = path.as_ref();
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

/// Writes a pretty-printed JSON document in full, replacing any previous version
/// through a temp-file rename so readers never observe a half-written file.
pub async fn write_json_pretty<T: Serialize + ?Sized>(
    path: impl AsRef<Path>,
    value: &T,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let mut bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    bytes.push(b'\n');

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document.json".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    debug!(path = %path.display(), bytes = bytes.len(), "wrote json document");
    Ok(())
}

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
            max_retries: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_lane_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub min_interval: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            per_lane_concurrency: 2,
            backoff: BackoffPolicy::default(),
            min_interval: None,
        }
    }
}

/// Enforces a minimum spacing between request starts (polite throttling for
/// per-listing page fetches).
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut last = self.last_start.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client. Requests are grouped into named lanes ("area-stats",
/// "images", an adapter's source id) each with its own concurrency limit, under a
/// global limit.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_lane_limit: usize,
    lanes: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_lane_limit: config.per_lane_concurrency.max(1),
            lanes: Mutex::new(HashMap::new()),
            pacer: config.min_interval.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    async fn lane_semaphore(&self, lane: &str) -> Arc<Semaphore> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(lane.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_lane_limit)))
            .clone()
    }

    /// GETs `url` as text, retrying transient failures per the backoff policy.
    pub async fn fetch_text(&self, lane: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", lane, url);
        self.fetch_text_inner(lane, url, self.backoff).instrument(span).await
    }

    /// Single attempt regardless of the configured backoff, for callers that own
    /// their retry schedule.
    pub async fn fetch_text_once(&self, lane: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", lane, url);
        self.fetch_text_inner(lane, url, BackoffPolicy::none()).instrument(span).await
    }

    async fn fetch_text_inner(
        &self,
        lane: &str,
        url: &str,
        backoff: BackoffPolicy,
    ) -> Result<FetchedPage, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("global semaphore is never closed");
        let lane_limit = self.lane_semaphore(lane).await;
        let _lane = lane_limit
            .acquire()
            .await
            .expect("lane semaphore is never closed");

        let mut attempt = 0usize;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let retry_left = attempt < backoff.max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable || !retry_left {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(%status, attempt, "retrying http status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !retry_left {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying request error");
                }
            }

            tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

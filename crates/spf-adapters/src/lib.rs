//! Source adapter contract, the source registry, and the generic adapters that
//! ship with the finder (fixture bundles and JSON listing feeds).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use spf_core::{parse_price, ListingDraft};
use spf_storage::{FetchError, HttpFetcher};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "spf-adapters";

/// Whether a source is searched once per location or once per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceScope {
    #[default]
    Local,
    Nationwide,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Empty for nationwide sources.
    pub location: String,
    pub radius: f64,
    pub max_price: f64,
}

impl SearchQuery {
    pub fn nationwide(max_price: f64) -> Self {
        Self {
            location: String::new(),
            radius: 0.0,
            max_price,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// A listing source. Implementations should return an empty result rather than an
/// error for "nothing found"; errors and hangs are contained by the orchestrator.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn scope(&self) -> SourceScope;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ListingDraft>, AdapterError>;
}

/// Captured listings for one source, replayed by [`FixtureAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub listings: Vec<ListingDraft>,
}

pub async fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Applies the query filters the real portals apply server-side. A price only
/// given as text ("Offers over £150,000") is parsed for the ceiling check.
fn matches_query(draft: &ListingDraft, query: &SearchQuery) -> bool {
    let price = draft
        .price
        .or_else(|| draft.price_text.as_deref().and_then(parse_price));
    let within_price = match price {
        Some(price) if price > 0.0 => price <= query.max_price,
        _ => true,
    };
    let location = query.location.trim();
    let in_location = location.is_empty()
        || draft
            .address
            .to_ascii_lowercase()
            .contains(&location.to_ascii_lowercase());
    within_price && in_location
}

#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    scope: SourceScope,
    bundle_path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, scope: SourceScope, bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            scope,
            bundle_path: bundle_path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn scope(&self) -> SourceScope {
        self.scope
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ListingDraft>, AdapterError> {
        let bundle = load_fixture_bundle(&self.bundle_path).await?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::Message(format!(
                "bundle source_id={} does not match adapter source_id={}",
                bundle.source_id, self.source_id
            )));
        }
        Ok(bundle
            .listings
            .into_iter()
            .filter(|draft| matches_query(draft, query))
            .collect())
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedBody {
    Bare(Vec<ListingDraft>),
    Wrapped { listings: Vec<ListingDraft> },
}

/// Parses a JSON listing feed: either a bare array or `{"listings": [...]}`.
pub fn parse_feed(body: &str) -> Result<Vec<ListingDraft>, AdapterError> {
    let parsed: FeedBody = serde_json::from_str(body)
        .map_err(|e| AdapterError::Message(format!("invalid listing feed: {e}")))?;
    Ok(match parsed {
        FeedBody::Bare(listings) => listings,
        FeedBody::Wrapped { listings } => listings,
    })
}

/// Queries a portal endpoint that speaks the draft JSON shape directly.
/// The query is passed as `location`, `radius` and `max_price` parameters.
#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    source_id: String,
    scope: SourceScope,
    feed_url: Url,
    http: Arc<HttpFetcher>,
}

impl JsonFeedAdapter {
    pub fn new(
        source_id: impl Into<String>,
        scope: SourceScope,
        feed_url: &str,
        http: Arc<HttpFetcher>,
    ) -> Result<Self> {
        let feed_url = Url::parse(feed_url).with_context(|| format!("parsing feed url {feed_url}"))?;
        Ok(Self {
            source_id: source_id.into(),
            scope,
            feed_url,
            http,
        })
    }

    pub fn request_url(&self, query: &SearchQuery) -> Url {
        let mut url = self.feed_url.clone();
        {
            let mut pairs = url.query_pairs_mut();
            if !query.location.trim().is_empty() {
                pairs.append_pair("location", query.location.trim());
                pairs.append_pair("radius", &query.radius.to_string());
            }
            pairs.append_pair("max_price", &format!("{:.0}", query.max_price));
        }
        url
    }
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn scope(&self) -> SourceScope {
        self.scope
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ListingDraft>, AdapterError> {
        let url = self.request_url(query);
        let page = self.http.fetch_text(&self.source_id, url.as_str()).await?;
        let drafts = parse_feed(&page.body)?;
        Ok(drafts
            .into_iter()
            .filter(|draft| matches_query(draft, query))
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub scope: SourceScope,
    pub kind: String,
    #[serde(default)]
    pub fixture_path: Option<String>,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_source_registry(path: impl AsRef<Path>) -> Result<SourceRegistry> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Builds the adapter for one registry entry, or `None` when the entry names an
/// unknown kind or lacks the parameters its kind needs.
pub fn adapter_for_source(
    config: &SourceConfig,
    workspace_root: &Path,
    http: &Arc<HttpFetcher>,
) -> Option<Arc<dyn SourceAdapter>> {
    match config.kind.as_str() {
        "fixture" => {
            let path = config.fixture_path.as_deref()?;
            Some(Arc::new(FixtureAdapter::new(
                config.source_id.clone(),
                config.scope,
                workspace_root.join(path),
            )))
        }
        "json_feed" => {
            let feed_url = config.feed_url.as_deref()?;
            match JsonFeedAdapter::new(config.source_id.clone(), config.scope, feed_url, http.clone()) {
                Ok(adapter) => Some(Arc::new(adapter)),
                Err(err) => {
                    warn!(source_id = %config.source_id, error = %err, "invalid feed url");
                    None
                }
            }
        }
        _ => None,
    }
}

/// Enabled adapters in declared order. Declared order is also the concatenation
/// order used before per-location deduplication.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves every enabled entry. Entries that cannot be resolved are skipped
    /// with a warning and returned so the caller can report them.
    pub fn from_config(
        registry: &SourceRegistry,
        workspace_root: &Path,
        http: &Arc<HttpFetcher>,
    ) -> (Self, Vec<String>) {
        let mut resolved = Self::new();
        let mut skipped = Vec::new();
        for source in registry.sources.iter().filter(|s| s.enabled) {
            match adapter_for_source(source, workspace_root, http) {
                Some(adapter) => resolved.adapters.push(adapter),
                None => {
                    warn!(
                        source_id = %source.source_id,
                        kind = %source.kind,
                        "no adapter for source; skipping"
                    );
                    skipped.push(source.source_id.clone());
                }
            }
        }
        (resolved, skipped)
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> &mut Self {
        self.adapters.push(adapter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn local(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters.iter().filter(|a| a.scope() == SourceScope::Local)
    }

    pub fn nationwide(&self) -> impl Iterator<Item = &Arc<dyn SourceAdapter>> {
        self.adapters
            .iter()
            .filter(|a| a.scope() == SourceScope::Nationwide)
    }
}

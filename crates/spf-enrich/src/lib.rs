//! Area-level market statistics: postal-area resolution, the persistent stats
//! cache and its bounded-concurrency refresh, and per-listing enrichment
//! (ROI, discount to area average).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use scraper::Html;
use serde::{Deserialize, Serialize};
use spf_core::{Listing, ScoreLedger, ScoreStage};
use spf_storage::{read_json, write_json_pretty, FetchError, HttpFetcher};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

pub mod images;

pub const CRATE_NAME: &str = "spf-enrich";

pub const CACHE_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const AREA_STATS_LANE: &str = "area-stats";

static AREA_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{1,2}[0-9][0-9A-Z]?)\b").expect("area code pattern compiles"));

static AVG_PRICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)average sold price.*?£([\d,]+)").expect("price pattern compiles"));

static AVG_RENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)average rent.*?£([\d,]+)").expect("rent pattern compiles"));

/// Extracts the postal-area code from an address. The last matching token wins,
/// since UK addresses put the postcode at the end.
pub fn resolve_area_code(address: &str) -> Option<String> {
    if address.trim().is_empty() {
        return None;
    }
    let upper = address.to_uppercase();
    AREA_CODE_RE
        .captures_iter(&upper)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn unix_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AreaStats {
    pub avg_price: Option<f64>,
    pub avg_rent: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
}

impl AreaStats {
    /// Fresh iff both metrics are present and the entry is younger than `expiry`.
    /// Missing data wins over the timestamp.
    pub fn is_fresh(&self, now: f64, expiry: Duration) -> bool {
        if self.avg_price.is_none() || self.avg_rent.is_none() {
            return false;
        }
        match self.timestamp {
            Some(ts) => now - ts < expiry.as_secs_f64(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct AreaStatsLookup {
    pub avg_price: Option<f64>,
    pub avg_rent: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AreaMetric {
    AvgPrice,
    AvgRent,
}

impl AreaMetric {
    pub fn label(self) -> &'static str {
        match self {
            AreaMetric::AvgPrice => "avg_price",
            AreaMetric::AvgRent => "avg_rent",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

/// External market-data source for one area metric. `Ok(None)` means the source
/// answered but had no figure.
#[async_trait]
pub trait AreaStatsProvider: Send + Sync {
    async fn fetch_metric(&self, metric: AreaMetric, area_code: &str) -> Result<Option<f64>, ProviderError>;

    async fn fetch_avg_price(&self, area_code: &str) -> Result<Option<f64>, ProviderError> {
        self.fetch_metric(AreaMetric::AvgPrice, area_code).await
    }

    async fn fetch_avg_rent(&self, area_code: &str) -> Result<Option<f64>, ProviderError> {
        self.fetch_metric(AreaMetric::AvgRent, area_code).await
    }
}

/// Reads sold-price and rent summary pages and pulls the headline figure out of
/// the page text. URL templates use `{area}` as the placeholder.
#[derive(Debug, Clone)]
pub struct HttpAreaStatsProvider {
    http: Arc<HttpFetcher>,
    price_url_template: String,
    rent_url_template: String,
}

pub const DEFAULT_PRICE_URL_TEMPLATE: &str = "https://www.zoopla.co.uk/house-prices/{area}/";
pub const DEFAULT_RENT_URL_TEMPLATE: &str = "https://www.home.co.uk/rental-prices/postcode/{area}/current";

impl HttpAreaStatsProvider {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_templates(http, DEFAULT_PRICE_URL_TEMPLATE, DEFAULT_RENT_URL_TEMPLATE)
    }

    pub fn with_templates(
        http: Arc<HttpFetcher>,
        price_url_template: impl Into<String>,
        rent_url_template: impl Into<String>,
    ) -> Self {
        Self {
            http,
            price_url_template: price_url_template.into(),
            rent_url_template: rent_url_template.into(),
        }
    }

    pub fn url_for(&self, metric: AreaMetric, area_code: &str) -> String {
        let template = match metric {
            AreaMetric::AvgPrice => &self.price_url_template,
            AreaMetric::AvgRent => &self.rent_url_template,
        };
        template.replace("{area}", &area_code.to_uppercase())
    }
}

#[async_trait]
impl AreaStatsProvider for HttpAreaStatsProvider {
    async fn fetch_metric(&self, metric: AreaMetric, area_code: &str) -> Result<Option<f64>, ProviderError> {
        let url = self.url_for(metric, area_code);
        // The refresh loop owns the retry, so the fetcher must not add its own.
        let page = self.http.fetch_text_once(AREA_STATS_LANE, &url).await?;
        Ok(extract_metric(&page.body, metric))
    }
}

/// Finds the headline figure in a stats page, e.g.
/// "The average sold price for a property in L4 ... is £134,233".
pub fn extract_metric(html: &str, metric: AreaMetric) -> Option<f64> {
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    let pattern = match metric {
        AreaMetric::AvgPrice => &*AVG_PRICE_RE,
        AreaMetric::AvgRent => &*AVG_RENT_RE,
    };
    pattern
        .captures(&text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse::<f64>().ok())
}

#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub time_unit: Duration,
    /// Jitter range before each area fetch, in time units.
    pub jitter_units: (f64, f64),
    /// Pause before the single retry of a metric, in time units.
    pub retry_delay_units: f64,
    /// Ceiling for one area's fetches; an area that exceeds it is skipped.
    pub area_timeout: Option<Duration>,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            batch_size: 5,
            time_unit: Duration::from_secs(1),
            jitter_units: (1.0, 3.0),
            retry_delay_units: 2.0,
            area_timeout: Some(Duration::from_secs(60)),
        }
    }
}

impl RefreshPolicy {
    /// Same limits, no waiting. Used for tests and replaying captured data.
    pub fn immediate() -> Self {
        Self {
            time_unit: Duration::ZERO,
            ..Self::default()
        }
    }

    fn jitter(&self) -> Duration {
        let (lo, hi) = self.jitter_units;
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let units = rand::thread_rng().gen_range(lo..=hi);
        self.time_unit.mul_f64(units.max(0.0))
    }

    fn retry_delay(&self) -> Duration {
        self.time_unit.mul_f64(self.retry_delay_units.max(0.0))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshReport {
    pub requested: usize,
    pub refreshed: usize,
    pub partial: usize,
    pub failed_metrics: usize,
    pub skipped_areas: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct FetchedArea {
    avg_price: Option<f64>,
    avg_rent: Option<f64>,
}

/// Persistent area code -> stats mapping. Reads (`get`) never fetch; fetching is
/// the separate `refresh` phase so callers can batch every refresh before reading.
/// Entries are never evicted.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaStatsCache {
    entries: BTreeMap<String, AreaStats>,
    expiry: Duration,
}

impl Default for AreaStatsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AreaStatsCache {
    pub fn new() -> Self {
        Self::from_entries(BTreeMap::new())
    }

    pub fn from_entries(entries: BTreeMap<String, AreaStats>) -> Self {
        Self {
            entries,
            expiry: CACHE_EXPIRY,
        }
    }

    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Loads the cache document. A missing or unreadable file starts an empty cache.
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match read_json::<BTreeMap<String, AreaStats>>(path).await {
            Ok(Some(entries)) => {
                debug!(path = %path.display(), areas = entries.len(), "loaded area stats cache");
                Self::from_entries(entries)
            }
            Ok(None) => Self::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load area stats cache; starting empty");
                Self::new()
            }
        }
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json_pretty(path, &self.entries).await
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, area_code: &str) -> Option<&AreaStats> {
        self.entries.get(area_code)
    }

    pub fn insert(&mut self, area_code: impl Into<String>, stats: AreaStats) {
        self.entries.insert(area_code.into(), stats);
    }

    pub fn get(&self, area_code: &str) -> AreaStatsLookup {
        self.entries
            .get(area_code)
            .map(|e| AreaStatsLookup {
                avg_price: e.avg_price,
                avg_rent: e.avg_rent,
            })
            .unwrap_or_default()
    }

    pub fn needs_refresh(&self, area_code: &str) -> bool {
        self.needs_refresh_at(area_code, unix_now())
    }

    pub fn needs_refresh_at(&self, area_code: &str, now: f64) -> bool {
        match self.entries.get(area_code) {
            Some(entry) => !entry.is_fresh(now, self.expiry),
            None => true,
        }
    }

    /// Refetches every code that needs it. Both metrics are refetched for a stale
    /// area even if one is still present; the whole entry is overwritten with a
    /// fresh timestamp, partial data included.
    pub async fn refresh(
        &mut self,
        area_codes: &BTreeSet<String>,
        provider: &dyn AreaStatsProvider,
        policy: &RefreshPolicy,
    ) -> RefreshReport {
        let now = unix_now();
        let pending: Vec<String> = area_codes
            .iter()
            .filter(|code| !code.trim().is_empty() && self.needs_refresh_at(code, now))
            .cloned()
            .collect();

        let mut report = RefreshReport {
            requested: pending.len(),
            ..RefreshReport::default()
        };
        if pending.is_empty() {
            return report;
        }
        info!(areas = pending.len(), "area stats need refreshing");

        let semaphore = Semaphore::new(policy.max_concurrent.max(1));
        for batch in pending.chunks(policy.batch_size.max(1)) {
            let fetches = batch
                .iter()
                .map(|code| fetch_area(code, provider, policy, &semaphore));
            let results = join_all(fetches).await;

            for (code, fetched) in batch.iter().zip(results) {
                let Some(fetched) = fetched else {
                    report.skipped_areas.push(code.clone());
                    continue;
                };
                let missing = [fetched.avg_price, fetched.avg_rent]
                    .iter()
                    .filter(|m| m.is_none())
                    .count();
                report.refreshed += 1;
                report.failed_metrics += missing;
                if missing > 0 {
                    report.partial += 1;
                }
                self.entries.insert(
                    code.clone(),
                    AreaStats {
                        avg_price: fetched.avg_price,
                        avg_rent: fetched.avg_rent,
                        timestamp: Some(unix_now()),
                    },
                );
            }
        }

        info!(
            refreshed = report.refreshed,
            partial = report.partial,
            skipped = report.skipped_areas.len(),
            "area stats refresh complete"
        );
        report
    }
}

async fn fetch_area(
    area_code: &str,
    provider: &dyn AreaStatsProvider,
    policy: &RefreshPolicy,
    semaphore: &Semaphore,
) -> Option<FetchedArea> {
    let Ok(_permit) = semaphore.acquire().await else {
        return None;
    };
    tokio::time::sleep(policy.jitter()).await;

    let work = async {
        let avg_price = fetch_metric_with_retry(provider, AreaMetric::AvgPrice, area_code, policy).await;
        let avg_rent = fetch_metric_with_retry(provider, AreaMetric::AvgRent, area_code, policy).await;
        FetchedArea { avg_price, avg_rent }
    }
    .instrument(info_span!("area_refresh", area_code));

    match policy.area_timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(fetched) => Some(fetched),
            Err(_) => {
                warn!(area_code, timeout_ms = limit.as_millis() as u64, "area stats fetch timed out; skipping area");
                None
            }
        },
        None => Some(work.await),
    }
}

/// One attempt plus a single retry. A metric that still fails resolves to `None`.
async fn fetch_metric_with_retry(
    provider: &dyn AreaStatsProvider,
    metric: AreaMetric,
    area_code: &str,
    policy: &RefreshPolicy,
) -> Option<f64> {
    for attempt in 0..2 {
        match provider.fetch_metric(metric, area_code).await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => debug!(metric = metric.label(), attempt, "no figure found"),
            Err(err) => debug!(metric = metric.label(), attempt, error = %err, "metric fetch failed"),
        }
        if attempt == 0 {
            debug!(metric = metric.label(), "retrying metric");
            tokio::time::sleep(policy.retry_delay()).await;
        }
    }
    warn!(metric = metric.label(), area_code, "metric unavailable after retry; recording null");
    None
}

/// Unique area codes across a listing set, for one batched refresh.
pub fn collect_area_codes<'a>(listings: impl IntoIterator<Item = &'a Listing>) -> BTreeSet<String> {
    listings
        .into_iter()
        .filter_map(|l| resolve_area_code(&l.address))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Enrichment {
    pub avg_area_price: Option<f64>,
    pub avg_area_rent: Option<f64>,
    pub roi: Option<f64>,
    pub discount: Option<f64>,
}

/// Gross yield as a percentage, rounded to 2 decimals.
pub fn compute_roi(price: Option<f64>, avg_rent: Option<f64>) -> Option<f64> {
    let price = price.filter(|p| *p > 0.0)?;
    let rent = avg_rent.filter(|r| r.is_finite())?;
    let roi = rent * 12.0 / price * 100.0;
    Some((roi * 100.0).round() / 100.0)
}

/// Percentage below the area average; negative when above it.
pub fn compute_discount(price: Option<f64>, avg_price: Option<f64>) -> Option<f64> {
    let price = price.filter(|p| *p > 0.0)?;
    let avg = avg_price.filter(|a| *a > 0.0)?;
    Some((avg - price) * 100.0 / avg)
}

pub fn enrichment_for(listing: &Listing, stats: &AreaStatsLookup) -> Enrichment {
    Enrichment {
        avg_area_price: stats.avg_price,
        avg_area_rent: stats.avg_rent,
        roi: compute_roi(listing.price, stats.avg_rent),
        discount: compute_discount(listing.price, stats.avg_price),
    }
}

/// Attaches area stats and derived metrics. Listings without a resolvable area
/// code are returned untouched.
pub fn enrich_listing(mut listing: Listing, cache: &AreaStatsCache) -> Listing {
    let Some(area_code) = resolve_area_code(&listing.address) else {
        return listing;
    };
    let enrichment = enrichment_for(&listing, &cache.get(&area_code));
    listing.avg_area_price = enrichment.avg_area_price;
    listing.avg_area_rent = enrichment.avg_area_rent;
    listing.roi = enrichment.roi;
    listing.discount = enrichment.discount;
    listing
}

/// Score bonuses for buying below the area average. At most one tier applies.
#[derive(Debug, Clone, Copy)]
pub struct DiscountAdjustments {
    pub strong_threshold: f64,
    pub strong_bonus: f64,
    pub mild_threshold: f64,
    pub mild_bonus: f64,
}

impl Default for DiscountAdjustments {
    fn default() -> Self {
        Self {
            strong_threshold: 40.0,
            strong_bonus: 2.0,
            mild_threshold: 20.0,
            mild_bonus: 1.0,
        }
    }
}

impl DiscountAdjustments {
    /// Applies the discount bonus, clamping into `[0, 10]` at this step.
    pub fn apply(&self, ledger: ScoreLedger, discount: Option<f64>) -> ScoreLedger {
        let Some(discount) = discount else {
            return ledger;
        };
        if discount > self.strong_threshold {
            ledger.add_clamped(
                ScoreStage::Discount,
                format!("{discount:.0}% below area average"),
                self.strong_bonus,
                0.0,
                10.0,
            )
        } else if discount > self.mild_threshold {
            ledger.add_clamped(
                ScoreStage::Discount,
                format!("{discount:.0}% below area average"),
                self.mild_bonus,
                0.0,
                10.0,
            )
        } else {
            ledger
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spf_core::ListingDraft;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedProvider {
        prices: HashMap<String, f64>,
        rents: HashMap<String, f64>,
        /// Number of leading calls per (metric, area) that answer `None`.
        flaky_first: HashMap<(AreaMetric, String), usize>,
        always_error: Vec<(AreaMetric, String)>,
        delay: Duration,
        calls: Mutex<HashMap<(AreaMetric, String), usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedProvider {
        fn calls(&self, metric: AreaMetric, code: &str) -> usize {
            *self
                .calls
                .lock()
                .unwrap()
                .get(&(metric, code.to_string()))
                .unwrap_or(&0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl AreaStatsProvider for ScriptedProvider {
        async fn fetch_metric(&self, metric: AreaMetric, area_code: &str) -> Result<Option<f64>, ProviderError> {
            let key = (metric, area_code.to_string());
            let call_no = {
                let mut calls = self.calls.lock().unwrap();
                let entry = calls.entry(key.clone()).or_default();
                *entry += 1;
                *entry
            };
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.always_error.contains(&key) {
                return Err(ProviderError::Message("provider down".into()));
            }
            if call_no <= *self.flaky_first.get(&key).unwrap_or(&0) {
                return Ok(None);
            }
            let table = match metric {
                AreaMetric::AvgPrice => &self.prices,
                AreaMetric::AvgRent => &self.rents,
            };
            Ok(table.get(area_code).copied())
        }
    }

    fn listing(address: &str, price: Option<f64>) -> Listing {
        Listing::from_draft(
            ListingDraft {
                id: "1".into(),
                title: "House".into(),
                address: address.into(),
                price,
                price_text: None,
                url: "https://portal.example/1".into(),
                description: String::new(),
                tenure: None,
                agent: None,
                image_url: None,
            },
            "fixture",
            None,
        )
    }

    fn codes(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn area_code_uses_last_match() {
        assert_eq!(resolve_area_code("Flat 2, 10 Smith St, Liverpool L4 0TH").as_deref(), Some("L4"));
        assert_eq!(resolve_area_code("B1 House, Stoke-on-Trent st4 2ab").as_deref(), Some("ST4"));
        assert_eq!(resolve_area_code("M1 Works, Leeds LS11").as_deref(), Some("LS11"));
        assert_eq!(resolve_area_code("Rose Cottage, Nowhere"), None);
        assert_eq!(resolve_area_code(""), None);
    }

    #[test]
    fn missing_rent_always_needs_refresh() {
        let now = 1_000_000.0;
        let mut cache = AreaStatsCache::new();
        cache.insert(
            "L4",
            AreaStats {
                avg_price: Some(120_000.0),
                avg_rent: None,
                timestamp: Some(now - 1.0),
            },
        );
        cache.insert(
            "L5",
            AreaStats {
                avg_price: Some(120_000.0),
                avg_rent: Some(650.0),
                timestamp: Some(now - 60.0),
            },
        );
        cache.insert(
            "L6",
            AreaStats {
                avg_price: Some(120_000.0),
                avg_rent: Some(650.0),
                timestamp: Some(now - CACHE_EXPIRY.as_secs_f64()),
            },
        );

        assert!(cache.needs_refresh_at("L4", now));
        assert!(!cache.needs_refresh_at("L5", now));
        assert!(cache.needs_refresh_at("L6", now));
        assert!(cache.needs_refresh_at("L7", now));
    }

    #[test]
    fn default_cache_keeps_the_weekly_expiry() {
        let now = 1_000_000.0;
        let mut cache = AreaStatsCache::default();
        cache.insert(
            "L5",
            AreaStats {
                avg_price: Some(120_000.0),
                avg_rent: Some(650.0),
                timestamp: Some(now - 3600.0),
            },
        );
        assert!(!cache.needs_refresh_at("L5", now));
    }

    #[test]
    fn get_is_a_pure_lookup() {
        let cache = AreaStatsCache::new();
        assert_eq!(cache.get("ZZ9"), AreaStatsLookup::default());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn fresh_entries_are_never_refetched() {
        let mut cache = AreaStatsCache::new();
        cache.insert(
            "L4",
            AreaStats {
                avg_price: Some(110_000.0),
                avg_rent: Some(700.0),
                timestamp: Some(unix_now()),
            },
        );
        let provider = ScriptedProvider::default();

        let report = cache
            .refresh(&codes(&["L4"]), &provider, &RefreshPolicy::immediate())
            .await;

        assert_eq!(report.requested, 0);
        assert_eq!(provider.total_calls(), 0);
        assert_eq!(cache.get("L4").avg_rent, Some(700.0));
    }

    #[tokio::test]
    async fn each_metric_is_retried_once_independently() {
        let mut provider = ScriptedProvider::default();
        provider.prices.insert("L4".into(), 95_000.0);
        provider.rents.insert("L4".into(), 650.0);
        provider.flaky_first.insert((AreaMetric::AvgPrice, "L4".into()), 1);
        provider.always_error.push((AreaMetric::AvgRent, "L5".into()));
        provider.prices.insert("L5".into(), 80_000.0);

        let mut cache = AreaStatsCache::new();
        let report = cache
            .refresh(&codes(&["L4", "L5"]), &provider, &RefreshPolicy::immediate())
            .await;

        assert_eq!(provider.calls(AreaMetric::AvgPrice, "L4"), 2);
        assert_eq!(provider.calls(AreaMetric::AvgRent, "L4"), 1);
        assert_eq!(provider.calls(AreaMetric::AvgRent, "L5"), 2);
        assert_eq!(cache.get("L4").avg_price, Some(95_000.0));

        // Partial data is recorded with a fresh timestamp but still reads as stale.
        let partial = cache.entry("L5").copied().unwrap();
        assert_eq!(partial.avg_price, Some(80_000.0));
        assert_eq!(partial.avg_rent, None);
        assert!(partial.timestamp.is_some());
        assert!(cache.needs_refresh("L5"));

        assert_eq!(report.requested, 2);
        assert_eq!(report.refreshed, 2);
        assert_eq!(report.partial, 1);
        assert_eq!(report.failed_metrics, 1);
    }

    #[tokio::test]
    async fn refresh_never_exceeds_two_concurrent_fetches() {
        let mut provider = ScriptedProvider {
            delay: Duration::from_millis(15),
            ..ScriptedProvider::default()
        };
        let all: Vec<String> = (1..=12).map(|n| format!("L{n}")).collect();
        for code in &all {
            provider.prices.insert(code.clone(), 100_000.0);
            provider.rents.insert(code.clone(), 600.0);
        }

        let mut cache = AreaStatsCache::new();
        let wanted: BTreeSet<String> = all.iter().cloned().collect();
        let report = cache.refresh(&wanted, &provider, &RefreshPolicy::immediate()).await;

        assert_eq!(report.refreshed, 12);
        let max = provider.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 2, "observed {max} concurrent fetches");
        assert!(max >= 1);
    }

    /// Logs when each area's first fetch starts and its last fetch ends.
    #[derive(Default)]
    struct TimedProvider {
        spans: Mutex<HashMap<String, (tokio::time::Instant, tokio::time::Instant)>>,
    }

    #[async_trait]
    impl AreaStatsProvider for TimedProvider {
        async fn fetch_metric(&self, _metric: AreaMetric, area_code: &str) -> Result<Option<f64>, ProviderError> {
            let started = tokio::time::Instant::now();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let finished = tokio::time::Instant::now();
            self.spans
                .lock()
                .unwrap()
                .entry(area_code.to_string())
                .and_modify(|span| span.1 = finished)
                .or_insert((started, finished));
            Ok(Some(500.0))
        }
    }

    #[tokio::test]
    async fn areas_refresh_in_batches_of_five_after_jitter() {
        let unit = Duration::from_millis(10);
        let policy = RefreshPolicy {
            time_unit: unit,
            ..RefreshPolicy::default()
        };
        let provider = TimedProvider::default();
        let all = codes(&["L1", "L2", "L3", "L4", "L5", "L6", "L7"]);
        let mut cache = AreaStatsCache::new();

        let began = tokio::time::Instant::now();
        let report = cache.refresh(&all, &provider, &policy).await;
        assert_eq!(report.refreshed, 7);

        let spans = provider.spans.lock().unwrap();
        let first: Vec<_> = ["L1", "L2", "L3", "L4", "L5"].iter().map(|c| spans[*c]).collect();
        let second: Vec<_> = ["L6", "L7"].iter().map(|c| spans[*c]).collect();
        let first_done = first.iter().map(|s| s.1).max().unwrap();

        for (start, _) in &first {
            assert!(*start >= began + unit);
        }
        for (start, _) in &second {
            assert!(*start >= first_done + unit);
        }
    }

    #[tokio::test]
    async fn slow_area_is_skipped_without_blocking_siblings() {
        struct SlowFor(&'static str);

        #[async_trait]
        impl AreaStatsProvider for SlowFor {
            async fn fetch_metric(&self, _metric: AreaMetric, area_code: &str) -> Result<Option<f64>, ProviderError> {
                if area_code == self.0 {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Ok(Some(1.0))
            }
        }

        let policy = RefreshPolicy {
            area_timeout: Some(Duration::from_millis(50)),
            ..RefreshPolicy::immediate()
        };
        let mut cache = AreaStatsCache::new();
        let report = cache
            .refresh(&codes(&["L4", "L9"]), &SlowFor("L9"), &policy)
            .await;

        assert_eq!(report.skipped_areas, vec!["L9".to_string()]);
        assert!(cache.entry("L9").is_none());
        assert_eq!(cache.get("L4").avg_rent, Some(1.0));
    }

    #[tokio::test]
    async fn cache_document_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("area_stats_cache.json");
        let mut cache = AreaStatsCache::new();
        cache.insert(
            "L4",
            AreaStats {
                avg_price: Some(120_000.0),
                avg_rent: None,
                timestamp: Some(1_700_000_000.5),
            },
        );
        cache.save(&path).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"L4\""));
        assert!(raw.contains("\"avg_rent\": null"));

        let loaded = AreaStatsCache::load(&path).await;
        assert_eq!(loaded, cache);

        std::fs::write(&path, "{not json").unwrap();
        assert!(AreaStatsCache::load(&path).await.is_empty());
    }

    #[test]
    fn roi_matches_reference_figure() {
        assert_eq!(compute_roi(Some(40_000.0), Some(700.0)), Some(21.0));
        assert_eq!(compute_roi(Some(0.0), Some(700.0)), None);
        assert_eq!(compute_roi(None, Some(700.0)), None);
        assert_eq!(compute_roi(Some(40_000.0), None), None);
        assert_eq!(compute_roi(Some(33_333.0), Some(512.0)), Some(18.43));
    }

    #[test]
    fn discount_requires_both_figures() {
        assert_eq!(compute_discount(Some(60_000.0), Some(100_000.0)), Some(40.0));
        assert_eq!(compute_discount(Some(60_000.0), Some(0.0)), None);
        assert_eq!(compute_discount(None, Some(100_000.0)), None);
    }

    #[test]
    fn enrich_listing_reads_cache_by_area_code() {
        let mut cache = AreaStatsCache::new();
        cache.insert(
            "L4",
            AreaStats {
                avg_price: Some(100_000.0),
                avg_rent: Some(700.0),
                timestamp: Some(unix_now()),
            },
        );
        let enriched = enrich_listing(listing("Walton, Liverpool L4 0TH", Some(40_000.0)), &cache);
        assert_eq!(enriched.roi, Some(21.0));
        assert_eq!(enriched.discount, Some(60.0));
        assert_eq!(enriched.avg_area_rent, Some(700.0));

        let untouched = enrich_listing(listing("Rose Cottage", Some(40_000.0)), &cache);
        assert_eq!(untouched.roi, None);
        assert_eq!(untouched.avg_area_price, None);
    }

    #[test]
    fn discount_bonus_clamps_at_the_adjustment() {
        let adjustments = DiscountAdjustments::default();
        let start = ScoreLedger::start(ScoreStage::Base, "rules", 9.0);
        assert_eq!(adjustments.apply(start.clone(), Some(55.0)).value(), 10.0);
        assert_eq!(adjustments.apply(start.clone(), Some(25.0)).value(), 10.0);
        assert_eq!(adjustments.apply(start.clone(), Some(5.0)).value(), 9.0);
        assert_eq!(adjustments.apply(start, None).value(), 9.0);
    }

    #[test]
    fn stats_pages_yield_headline_figures() {
        let price_page = r#"<html><body><h1>House prices in L4</h1>
            <p>The average sold price for a property in L4 in the last 12 months is <b>£134,233</b>.</p></body></html>"#;
        let rent_page = "<html><body><div>Average rent</div><span>£650 pcm</span></body></html>";
        assert_eq!(extract_metric(price_page, AreaMetric::AvgPrice), Some(134_233.0));
        assert_eq!(extract_metric(rent_page, AreaMetric::AvgRent), Some(650.0));
        assert_eq!(extract_metric("<p>nothing</p>", AreaMetric::AvgRent), None);
    }
}

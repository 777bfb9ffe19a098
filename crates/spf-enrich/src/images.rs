//! Listing image discovery from listing pages: social meta tags and JSON-LD.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;
use spf_core::Listing;
use spf_storage::{read_json, write_json_pretty, FetchError, HttpFetcher};
use tracing::{debug, info, warn};

const IMAGES_LANE: &str = "images";

static JSON_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(\{.*\}|\[.*\])").expect("json block pattern compiles"));

static OG_IMAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:image"]"#).expect("og selector parses"));
static TWITTER_IMAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="twitter:image"]"#).expect("twitter selector parses"));
static JSON_LD: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).expect("json-ld selector parses"));

/// Anything that can hand back a listing page body.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError>;
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<String, FetchError> {
        Ok(self.fetch_text(IMAGES_LANE, url).await?.body)
    }
}

fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.strip_prefix("//") {
        Some(rest) => format!("https://{rest}"),
        None => trimmed.to_string(),
    }
}

/// Higher is better. Property photo CDNs rank first; logos and icons sink below zero.
pub fn score_image_candidate(url: &str) -> i32 {
    let u = url.to_lowercase();
    let tiers: [(i32, &[&str]); 3] = [
        (100, &["property-photo", "dir/crop", "rm"]),
        (90, &["lid.zoocdn", "zoocdn", "media.zoopla", "zoopla"]),
        (80, &["uploads", "images", "cdn"]),
    ];

    let mut score = tiers
        .iter()
        .filter(|(_, needles)| needles.iter().any(|n| u.contains(n)))
        .map(|(points, _)| *points)
        .max()
        .unwrap_or(0);

    if ["logo", "favicon", "sprite", "icon", "brand"].iter().any(|n| u.contains(n)) {
        score -= 80;
    }
    if u.contains("logo-share") {
        score -= 200;
    }
    if [".jpg", ".jpeg", ".webp"].iter().any(|ext| u.ends_with(ext)) {
        score += 5;
    }
    if [".gif", ".svg"].iter().any(|ext| u.ends_with(ext)) {
        score -= 20;
    }
    score
}

fn collect_json_ld_images(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_json_ld_images(item, out);
            }
        }
        Value::Object(map) => {
            if let Some(image) = map.get("image") {
                match image {
                    Value::String(url) => out.push(url.clone()),
                    Value::Array(items) => {
                        for item in items {
                            match item {
                                Value::String(url) => out.push(url.clone()),
                                Value::Object(obj) => {
                                    if let Some(Value::String(url)) = obj.get("url") {
                                        out.push(url.clone());
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    Value::Object(obj) => {
                        if let Some(Value::String(url)) = obj.get("url") {
                            out.push(url.clone());
                        }
                    }
                    _ => {}
                }
            }
            for nested in map.values() {
                if nested.is_object() || nested.is_array() {
                    collect_json_ld_images(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn parse_json_ld(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok().or_else(|| {
        JSON_BLOCK_RE
            .captures(raw)
            .and_then(|caps| caps.get(1))
            .and_then(|m| serde_json::from_str(m.as_str()).ok())
    })
}

/// Picks the best-looking image for a listing page, or `None` if every candidate
/// looks like site chrome.
pub fn extract_best_image_url(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let mut candidates = Vec::new();

    for selector in [&*OG_IMAGE, &*TWITTER_IMAGE] {
        if let Some(content) = document
            .select(selector)
            .next()
            .and_then(|el| el.value().attr("content"))
        {
            candidates.push(content.to_string());
        }
    }
    for script in document.select(&JSON_LD) {
        let raw: String = script.text().collect();
        if let Some(value) = parse_json_ld(&raw) {
            collect_json_ld_images(&value, &mut candidates);
        }
    }

    // max_by_key keeps the last maximum; reverse so the earliest source wins ties.
    candidates
        .iter()
        .map(|c| normalize_url(c))
        .filter(|c| !c.is_empty())
        .rev()
        .max_by_key(|c| score_image_candidate(c))
        .filter(|best| score_image_candidate(best) > 0)
}

/// Listing url -> image url, persisted between runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageCache {
    entries: BTreeMap<String, String>,
}

impl ImageCache {
    pub async fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match read_json::<BTreeMap<String, String>>(path).await {
            Ok(entries) => Self {
                entries: entries.unwrap_or_default(),
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load image cache; starting empty");
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json_pretty(path, &self.entries).await
    }

    pub fn get(&self, listing_url: &str) -> Option<&str> {
        self.entries
            .get(listing_url)
            .map(String::as_str)
            .filter(|u| !u.is_empty())
    }

    pub fn insert(&mut self, listing_url: impl Into<String>, image_url: impl Into<String>) {
        self.entries.insert(listing_url.into(), image_url.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImageReport {
    pub missing: usize,
    pub attempted: usize,
    pub from_cache: usize,
    pub updated: usize,
}

/// Fills `image_url` on listings that lack one, stopping after `max_images`
/// updates. Fetches are sequential with `pause` between them; failures are skipped.
pub async fn enrich_images(
    listings: &mut [Listing],
    cache: &mut ImageCache,
    pages: &dyn PageSource,
    max_images: usize,
    pause: Duration,
) -> ImageReport {
    let mut report = ImageReport {
        missing: listings
            .iter()
            .filter(|l| l.image_url.is_none() && !l.url.trim().is_empty())
            .count(),
        ..ImageReport::default()
    };
    info!(total = listings.len(), missing = report.missing, "enriching listing images");

    for listing in listings.iter_mut() {
        if report.updated >= max_images {
            break;
        }
        if listing.image_url.is_some() {
            continue;
        }
        let url = listing.url.trim().to_string();
        if url.is_empty() {
            continue;
        }

        if let Some(hit) = cache.get(&url) {
            listing.image_url = Some(hit.to_string());
            report.from_cache += 1;
            report.updated += 1;
            continue;
        }

        report.attempted += 1;
        if report.attempted % 25 == 0 {
            info!(attempted = report.attempted, updated = report.updated, "image fetch progress");
        }
        match pages.fetch_page(&url).await {
            Ok(html) => {
                if let Some(image) = extract_best_image_url(&html) {
                    cache.insert(url.clone(), image.clone());
                    listing.image_url = Some(image);
                    report.updated += 1;
                }
            }
            Err(err) => debug!(url, error = %err, "listing page fetch failed"),
        }
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    info!(updated = report.updated, from_cache = report.from_cache, "image enrichment complete");
    report
}

//! Batch orchestration: runs the registered sources across locations under
//! per-source, per-location and whole-run time limits, then merges, enriches,
//! scores, ranks and exports the result set.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use spf_adapters::{load_source_registry, AdapterRegistry, SearchQuery, SourceAdapter};
use spf_core::{merge_by_identity, Category, Listing, ListingDraft, NATIONWIDE_LOCATION};
use spf_enrich::images::{enrich_images, ImageCache, ImageReport, PageSource};
use spf_enrich::{
    collect_area_codes, enrich_listing, AreaStatsCache, AreaStatsProvider, DiscountAdjustments,
    HttpAreaStatsProvider, RefreshPolicy, RefreshReport,
};
use spf_scoring::{rank_listings, score_top_n, RuleScorer, ScoringEngine, SecondaryReport, SecondaryScorer};
use spf_storage::{read_json, write_json_pretty, HttpClientConfig, HttpFetcher, PropertiesExport};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "spf-pipeline";

pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_LOCATION_TIMEOUT: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(25 * 60);
pub const DEFAULT_TOP_N: usize = 200;
pub const DEFAULT_MAX_PRICE: f64 = 100_000.0;
pub const DEFAULT_RADIUS_MILES: f64 = 5.0;

/// Preset search set selected by the `england` keyword.
pub const ENGLAND_LOCATIONS: &[&str] = &[
    "Liverpool", "Manchester", "Preston", "Blackpool", "Bolton", "Wigan",
    "Newcastle", "Sunderland", "Middlesbrough", "Durham",
    "Leeds", "Sheffield", "Bradford", "Hull", "York", "Doncaster",
    "Nottingham", "Leicester", "Derby", "Lincoln",
    "Birmingham", "Coventry", "Wolverhampton", "Stoke-on-Trent",
    "Norwich", "Cambridge", "Ipswich", "Peterborough",
    "Brighton", "Southampton", "Portsmouth", "Reading", "Oxford", "Milton Keynes",
    "Bristol", "Plymouth", "Exeter", "Bournemouth", "Gloucester",
    "Croydon", "Barking", "Dagenham",
];

/// `"england"` expands to the preset list; anything else is a comma-separated list.
pub fn resolve_locations(raw: &str) -> Vec<String> {
    if raw.trim().eq_ignore_ascii_case("england") {
        return ENGLAND_LOCATIONS.iter().map(|l| l.to_string()).collect();
    }
    raw.split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub sources_path: PathBuf,
    pub output_path: PathBuf,
    pub area_cache_path: PathBuf,
    pub image_cache_path: PathBuf,
    pub locations: Vec<String>,
    pub max_price: f64,
    pub radius: f64,
    pub exclude_land: bool,
    pub top_n: usize,
    pub source_timeout: Duration,
    pub location_timeout: Duration,
    pub run_timeout: Duration,
    /// When false, enrichment reads the cache as-is and issues no area-stats fetches.
    pub refresh_area_stats: bool,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::rooted_at(PathBuf::from("."))
    }
}

impl PipelineConfig {
    pub fn rooted_at(workspace_root: PathBuf) -> Self {
        Self {
            sources_path: workspace_root.join("sources.yaml"),
            output_path: workspace_root.join("data").join("properties.json"),
            area_cache_path: workspace_root.join("data").join("area_stats_cache.json"),
            image_cache_path: workspace_root.join("data").join("image_cache.json"),
            workspace_root,
            locations: resolve_locations("england"),
            max_price: DEFAULT_MAX_PRICE,
            radius: DEFAULT_RADIUS_MILES,
            exclude_land: false,
            top_n: DEFAULT_TOP_N,
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            location_timeout: DEFAULT_LOCATION_TIMEOUT,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            refresh_area_stats: true,
            scheduler_enabled: false,
            sync_cron_1: "0 6 * * *".to_string(),
            sync_cron_2: "0 18 * * *".to_string(),
            user_agent: "smart-property-finder/0.1".to_string(),
            http_timeout_secs: 20,
        }
    }

    pub fn from_env() -> Self {
        let root = env_string("SPF_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let defaults = Self::rooted_at(root);
        Self {
            sources_path: env_string("SPF_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.sources_path),
            output_path: env_string("SPF_OUTPUT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_path),
            area_cache_path: env_string("SPF_AREA_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.area_cache_path),
            image_cache_path: env_string("SPF_IMAGE_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.image_cache_path),
            locations: env_string("SPF_LOCATIONS")
                .map(|v| resolve_locations(&v))
                .unwrap_or(defaults.locations),
            max_price: env_parse("SPF_MAX_PRICE").unwrap_or(defaults.max_price),
            radius: env_parse("SPF_RADIUS").unwrap_or(defaults.radius),
            exclude_land: env_flag("SPF_EXCLUDE_LAND").unwrap_or(defaults.exclude_land),
            top_n: env_parse("SPF_TOP_N").unwrap_or(defaults.top_n),
            source_timeout: env_parse("SPF_SOURCE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.source_timeout),
            location_timeout: env_parse("SPF_LOCATION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.location_timeout),
            run_timeout: env_parse("SPF_RUN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            refresh_area_stats: env_flag("SPF_REFRESH_AREA_STATS").unwrap_or(defaults.refresh_area_stats),
            scheduler_enabled: env_flag("SPF_SCHEDULER_ENABLED").unwrap_or(defaults.scheduler_enabled),
            sync_cron_1: env_string("SPF_SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: env_string("SPF_SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
            user_agent: env_string("SPF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("SPF_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            workspace_root: defaults.workspace_root,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
}

/// Whole-run wall-clock ceiling, checked at every unit boundary.
#[derive(Debug, Clone, Copy)]
pub struct RunDeadline {
    started: Instant,
    limit: Duration,
}

impl RunDeadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// The smaller of `limit` and the time left in the run.
    pub fn bound(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    Pending,
    Aggregating,
    Merging,
    Enriching,
    Scoring,
    Exporting,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Completed,
    TimedOut,
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub location: String,
    pub outcome: SourceOutcome,
    pub listings: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Completed,
    /// The location ceiling elapsed; everything it gathered was discarded.
    TimedOut,
    /// The run deadline elapsed mid-location; completed sources were kept.
    CutByDeadline,
    NotStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub location: String,
    pub outcome: UnitOutcome,
    pub sources: Vec<SourceReport>,
    pub listings: usize,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<RunPhase>,
    pub units: Vec<UnitReport>,
    pub gathered: usize,
    pub duplicates_dropped: usize,
    pub refresh: Option<RefreshReport>,
    pub secondary: SecondaryReport,
    pub filtered_out: usize,
    pub exported: usize,
    pub output_path: String,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: String,
    pub listings: usize,
    pub refresh: Option<RefreshReport>,
    pub secondary: Option<SecondaryReport>,
}

/// Failures the run absorbs and logs. Only `RunTimeout` reaches the caller, and
/// only after the partial export has been written.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source `{source_id}` timed out after {seconds:.1}s searching {location}")]
    SourceTimeout {
        source_id: String,
        location: String,
        seconds: f64,
    },
    #[error("source `{source_id}` failed searching {location}: {message}")]
    SourceError {
        source_id: String,
        location: String,
        message: String,
    },
    #[error("location `{location}` exceeded {seconds:.0}s; discarding its results")]
    LocationTimeout { location: String, seconds: f64 },
    #[error("area stats unavailable for {area_code}")]
    CacheFetchFailure { area_code: String },
    #[error("run exceeded its {seconds:.0}s deadline; exported {exported} listings gathered so far")]
    RunTimeout { seconds: f64, exported: usize },
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one adapter call as its own task so a panic or hang stays contained.
async fn run_source(
    adapter: Arc<dyn SourceAdapter>,
    query: SearchQuery,
    location: &str,
    limit: Duration,
) -> (SourceReport, Vec<ListingDraft>) {
    let source_id = adapter.source_id().to_string();
    let started = Instant::now();
    let span = info_span!("source", source_id = %source_id, location);
    let mut task = AbortOnDrop(tokio::spawn(
        async move { adapter.search(&query).await }.instrument(span),
    ));

    let (outcome, drafts) = match tokio::time::timeout(limit, &mut task.0).await {
        Ok(Ok(Ok(drafts))) => (SourceOutcome::Completed, drafts),
        Ok(Ok(Err(err))) => source_failure(&source_id, location, err.to_string()),
        Ok(Err(join_err)) => {
            let message = if join_err.is_panic() {
                "adapter panicked".to_string()
            } else {
                "adapter task cancelled".to_string()
            };
            source_failure(&source_id, location, message)
        }
        Err(_) => {
            let err = PipelineError::SourceTimeout {
                source_id: source_id.clone(),
                location: location.to_string(),
                seconds: limit.as_secs_f64(),
            };
            warn!(error = %err, "source timed out");
            (SourceOutcome::TimedOut, Vec::new())
        }
    };

    let report = SourceReport {
        source_id,
        location: location.to_string(),
        outcome,
        listings: drafts.len(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    info!(source_id = %report.source_id, listings = report.listings, outcome = ?report.outcome, "source finished");
    (report, drafts)
}

fn source_failure(source_id: &str, location: &str, message: String) -> (SourceOutcome, Vec<ListingDraft>) {
    let err = PipelineError::SourceError {
        source_id: source_id.to_string(),
        location: location.to_string(),
        message: message.clone(),
    };
    warn!(error = %err, "source failed");
    (SourceOutcome::Failed { message }, Vec::new())
}

pub struct Pipeline {
    config: PipelineConfig,
    adapters: AdapterRegistry,
    area_stats: Arc<dyn AreaStatsProvider>,
    pages: Arc<dyn PageSource>,
    secondary: Arc<dyn SecondaryScorer>,
    engine: ScoringEngine,
    discounts: DiscountAdjustments,
    refresh_policy: RefreshPolicy,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        adapters: AdapterRegistry,
        area_stats: Arc<dyn AreaStatsProvider>,
        pages: Arc<dyn PageSource>,
    ) -> Self {
        let engine = ScoringEngine::default();
        Self {
            config,
            adapters,
            area_stats,
            pages,
            secondary: Arc::new(RuleScorer::new(engine)),
            engine,
            discounts: DiscountAdjustments::default(),
            refresh_policy: RefreshPolicy::default(),
        }
    }

    /// Wires the HTTP-backed collaborators and the adapters declared in `sources.yaml`.
    pub fn from_config(config: PipelineConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let registry = load_source_registry(&config.sources_path)?;
        let (adapters, skipped) = AdapterRegistry::from_config(&registry, &config.workspace_root, &http);
        info!(adapters = adapters.len(), skipped = skipped.len(), "resolved source adapters");

        let area_stats = Arc::new(HttpAreaStatsProvider::new(http.clone()));
        Ok(Self::new(config, adapters, area_stats, http))
    }

    pub fn with_secondary_scorer(mut self, scorer: Arc<dyn SecondaryScorer>) -> Self {
        self.secondary = scorer;
        self
    }

    pub fn with_refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let deadline = RunDeadline::new(self.config.run_timeout);
        let mut phases = vec![RunPhase::Pending];
        info!(
            locations = self.config.locations.len(),
            sources = self.adapters.len(),
            max_price = self.config.max_price,
            "starting run"
        );

        phases.push(RunPhase::Aggregating);
        let (units, gathered) = self.aggregate(&deadline).await;
        let gathered_count = gathered.len();

        phases.push(RunPhase::Merging);
        let merged = merge_by_identity(gathered);
        let duplicates_dropped = merged.dropped.len();
        info!(kept = merged.kept.len(), dropped = duplicates_dropped, "global merge complete");

        phases.push(RunPhase::Enriching);
        let mut cache = AreaStatsCache::load(&self.config.area_cache_path).await;
        let refresh = self.refresh_area_stats(&mut cache, &merged.kept, &deadline).await;
        let mut listings: Vec<Listing> = merged
            .kept
            .into_iter()
            .map(|l| enrich_listing(l, &cache))
            .collect();
        let timed_out = deadline.expired()
            || units
                .iter()
                .any(|u| matches!(u.outcome, UnitOutcome::CutByDeadline | UnitOutcome::NotStarted));

        phases.push(RunPhase::Scoring);
        let secondary = self.score_and_rank(&mut listings).await;
        let (listings, filtered_out) = self.apply_filters(listings);

        phases.push(RunPhase::Exporting);
        let export = PropertiesExport::new(
            Utc::now(),
            self.config.locations.clone(),
            self.config.max_price,
            listings,
        );
        write_json_pretty(&self.config.output_path, &export)
            .await
            .with_context(|| format!("writing export {}", self.config.output_path.display()))?;
        self.save_area_cache(&cache).await;
        phases.push(RunPhase::Done);

        if timed_out {
            let err = PipelineError::RunTimeout {
                seconds: deadline.limit().as_secs_f64(),
                exported: export.total_count,
            };
            warn!(error = %err, "run deadline reached");
        }
        info!(exported = export.total_count, filtered_out, timed_out, "run complete");

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            phases,
            units,
            gathered: gathered_count,
            duplicates_dropped,
            refresh,
            secondary,
            filtered_out,
            exported: export.total_count,
            output_path: self.config.output_path.display().to_string(),
            timed_out,
        })
    }

    /// Nationwide sources once, then local sources per location, in declared order.
    pub async fn aggregate(&self, deadline: &RunDeadline) -> (Vec<UnitReport>, Vec<Listing>) {
        let nationwide: Vec<_> = self.adapters.nationwide().cloned().collect();
        let local: Vec<_> = self.adapters.local().cloned().collect();

        let mut plan = Vec::new();
        if !nationwide.is_empty() {
            plan.push((
                NATIONWIDE_LOCATION.to_string(),
                SearchQuery::nationwide(self.config.max_price),
                nationwide,
            ));
        }
        if !local.is_empty() {
            for location in &self.config.locations {
                let query = SearchQuery {
                    location: location.clone(),
                    radius: self.config.radius,
                    max_price: self.config.max_price,
                };
                plan.push((location.clone(), query, local.clone()));
            }
        }

        let mut reports = Vec::with_capacity(plan.len());
        let mut gathered = Vec::new();
        for (label, query, adapters) in plan {
            if deadline.expired() {
                reports.push(UnitReport {
                    location: label,
                    outcome: UnitOutcome::NotStarted,
                    sources: Vec::new(),
                    listings: 0,
                    duplicates_dropped: 0,
                });
                continue;
            }
            let span = info_span!("location", location = %label);
            let (report, listings) = self
                .run_unit(&label, &query, &adapters, deadline)
                .instrument(span)
                .await;
            reports.push(report);
            gathered.extend(listings);
        }
        (reports, gathered)
    }

    async fn run_unit(
        &self,
        label: &str,
        query: &SearchQuery,
        adapters: &[Arc<dyn SourceAdapter>],
        deadline: &RunDeadline,
    ) -> (UnitReport, Vec<Listing>) {
        let work = async {
            let mut sources = Vec::with_capacity(adapters.len());
            let mut gathered = Vec::new();
            let mut cut = false;
            for adapter in adapters {
                if deadline.expired() {
                    cut = true;
                    break;
                }
                let limit = deadline.bound(self.config.source_timeout);
                let (report, drafts) = run_source(adapter.clone(), query.clone(), label, limit).await;
                gathered.extend(
                    drafts
                        .into_iter()
                        .map(|d| Listing::from_draft(d, &report.source_id, Some(label))),
                );
                sources.push(report);
            }
            (sources, gathered, cut)
        };

        match tokio::time::timeout(self.config.location_timeout, work).await {
            Ok((sources, gathered, cut)) => {
                let merged = merge_by_identity(gathered);
                for dup in &merged.dropped {
                    debug!(
                        id = %dup.id,
                        source_id = %dup.source_id,
                        kept_id = %dup.kept_id,
                        matched_on = ?dup.matched_on,
                        "dropped duplicate"
                    );
                }
                let mut listings = merged.kept;
                for listing in &mut listings {
                    let card = self.engine.score_listing(listing);
                    card.apply_to(listing);
                }
                info!(listings = listings.len(), duplicates = merged.dropped.len(), "location complete");
                let report = UnitReport {
                    location: label.to_string(),
                    outcome: if cut {
                        UnitOutcome::CutByDeadline
                    } else {
                        UnitOutcome::Completed
                    },
                    sources,
                    listings: listings.len(),
                    duplicates_dropped: merged.dropped.len(),
                };
                (report, listings)
            }
            Err(_) => {
                let err = PipelineError::LocationTimeout {
                    location: label.to_string(),
                    seconds: self.config.location_timeout.as_secs_f64(),
                };
                warn!(error = %err, "location timed out");
                let report = UnitReport {
                    location: label.to_string(),
                    outcome: UnitOutcome::TimedOut,
                    sources: Vec::new(),
                    listings: 0,
                    duplicates_dropped: 0,
                };
                (report, Vec::new())
            }
        }
    }

    async fn refresh_area_stats(
        &self,
        cache: &mut AreaStatsCache,
        listings: &[Listing],
        deadline: &RunDeadline,
    ) -> Option<RefreshReport> {
        if !self.config.refresh_area_stats {
            debug!("area stats refresh disabled; using cached figures");
            return None;
        }
        if deadline.expired() {
            warn!("run deadline reached; enriching from cached area stats only");
            return None;
        }
        let codes = collect_area_codes(listings);
        let refresh = cache.refresh(&codes, self.area_stats.as_ref(), &self.refresh_policy);
        match tokio::time::timeout(deadline.remaining(), refresh).await {
            Ok(report) => {
                for area_code in &report.skipped_areas {
                    let err = PipelineError::CacheFetchFailure {
                        area_code: area_code.clone(),
                    };
                    warn!(error = %err, "area skipped");
                }
                Some(report)
            }
            Err(_) => {
                warn!("run deadline reached during area stats refresh; keeping what was fetched");
                None
            }
        }
    }

    async fn save_area_cache(&self, cache: &AreaStatsCache) {
        if let Err(err) = cache.save(&self.config.area_cache_path).await {
            warn!(error = %err, "failed to persist area stats cache");
        }
    }

    /// Recomputes the score from the listing's current attributes, discarding any
    /// previous score, secondary result included.
    pub fn rescore(&self, listing: &mut Listing) {
        let card = self.engine.score_listing(listing);
        let ledger = self.discounts.apply(card.ledger.clone(), listing.discount);
        card.apply_to(listing);
        listing.investment_score = ledger.value();
        listing.llm_score = None;
        listing.llm_reasoning = None;
    }

    async fn score_and_rank(&self, listings: &mut [Listing]) -> SecondaryReport {
        for listing in listings.iter_mut() {
            self.rescore(listing);
        }
        rank_listings(listings);
        let report = score_top_n(listings, self.secondary.as_ref(), self.config.top_n).await;
        rank_listings(listings);
        report
    }

    fn apply_filters(&self, listings: Vec<Listing>) -> (Vec<Listing>, usize) {
        let before = listings.len();
        let kept: Vec<Listing> = listings
            .into_iter()
            .filter(|l| !(self.config.exclude_land && l.category == Category::Land))
            .filter(|l| l.known_price().map_or(true, |p| p <= self.config.max_price))
            .collect();
        let filtered_out = before - kept.len();
        (kept, filtered_out)
    }

    /// Refreshes area stats for an existing export, re-enriches, rescores and
    /// writes it back.
    pub async fn enrich_export(&self, path: &Path) -> Result<ExportReport> {
        let mut export = load_export(path).await?;
        let mut cache = AreaStatsCache::load(&self.config.area_cache_path).await;
        let deadline = RunDeadline::new(self.config.run_timeout);
        let refresh = self.refresh_area_stats(&mut cache, &export.properties, &deadline).await;

        export.properties = std::mem::take(&mut export.properties)
            .into_iter()
            .map(|l| enrich_listing(l, &cache))
            .collect();
        let secondary = self.score_and_rank(&mut export.properties).await;
        export.touch(Utc::now());
        write_json_pretty(path, &export).await?;
        self.save_area_cache(&cache).await;

        Ok(ExportReport {
            path: path.display().to_string(),
            listings: export.total_count,
            refresh,
            secondary: Some(secondary),
        })
    }

    /// Rescores an existing export from its stored attributes, no network.
    pub async fn analyze_export(&self, path: &Path) -> Result<ExportReport> {
        let mut export = load_export(path).await?;
        let secondary = self.score_and_rank(&mut export.properties).await;
        export.touch(Utc::now());
        write_json_pretty(path, &export).await?;
        Ok(ExportReport {
            path: path.display().to_string(),
            listings: export.total_count,
            refresh: None,
            secondary: Some(secondary),
        })
    }

    pub async fn enrich_images_export(&self, path: &Path, max_images: usize, pause: Duration) -> Result<ImageReport> {
        let mut export = load_export(path).await?;
        let mut cache = ImageCache::load(&self.config.image_cache_path).await;
        let report = enrich_images(&mut export.properties, &mut cache, self.pages.as_ref(), max_images, pause).await;
        export.touch(Utc::now());
        write_json_pretty(path, &export).await?;
        cache
            .save(&self.config.image_cache_path)
            .await
            .context("saving image cache")?;
        Ok(report)
    }
}

async fn load_export(path: &Path) -> Result<PropertiesExport> {
    let mut export: PropertiesExport = read_json(path)
        .await?
        .with_context(|| format!("no properties export at {}", path.display()))?;
    for listing in &mut export.properties {
        listing.ensure_price_display();
    }
    Ok(export)
}

/// Registers the two daily batch runs when scheduling is enabled.
pub async fn maybe_build_scheduler(pipeline: Arc<Pipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        pipeline.config.sync_cron_1.clone(),
        pipeline.config.sync_cron_2.clone(),
    ];
    for cron in crons {
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        exported = summary.exported,
                        timed_out = summary.timed_out,
                        "scheduled run finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

pub async fn run_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::from_config(PipelineConfig::from_env())?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn england_expands_to_preset() {
        let locations = resolve_locations(" England ");
        assert_eq!(locations.len(), ENGLAND_LOCATIONS.len());
        assert_eq!(locations[0], "Liverpool");
        assert_eq!(resolve_locations("Liverpool, Hull,,"), vec!["Liverpool", "Hull"]);
    }

    #[test]
    fn defaults_follow_the_batch_limits() {
        let config = PipelineConfig::rooted_at(PathBuf::from("/srv/spf"));
        assert_eq!(config.source_timeout, Duration::from_secs(60));
        assert_eq!(config.location_timeout, Duration::from_secs(180));
        assert_eq!(config.run_timeout, Duration::from_secs(1500));
        assert_eq!(config.top_n, 200);
        assert_eq!(config.output_path, PathBuf::from("/srv/spf/data/properties.json"));
        assert!(!config.exclude_land);
    }

    #[tokio::test]
    async fn deadline_bounds_unit_limits() {
        let deadline = RunDeadline::new(Duration::from_millis(50));
        assert!(deadline.bound(Duration::from_secs(60)) <= Duration::from_millis(50));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(deadline.expired());
        assert_eq!(deadline.bound(Duration::from_secs(60)), Duration::ZERO);
    }
}

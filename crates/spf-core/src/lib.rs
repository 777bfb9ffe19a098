//! Core domain model for the property finder: listing records, the score ledger
//! threaded through scoring stages, and the identity/merge engine.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "spf-core";

/// Location label attached to listings found by nationwide sources.
pub const NATIONWIDE_LOCATION: &str = "Nationwide";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Tenure {
    Freehold,
    Leasehold,
    #[default]
    Unknown,
}

impl Tenure {
    /// Best-effort tenure detection from adapter-supplied text ("Freehold", "LEASEHOLD (99 yrs)").
    pub fn from_text(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        if lower.contains("freehold") {
            Tenure::Freehold
        } else if lower.contains("leasehold") {
            Tenure::Leasehold
        } else {
            Tenure::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Category {
    #[default]
    Standard,
    #[serde(rename = "Fixer Upper")]
    FixerUpper,
    Distressed,
    Land,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Standard => "Standard",
            Category::FixerUpper => "Fixer Upper",
            Category::Distressed => "Distressed",
            Category::Land => "Land",
        };
        f.write_str(label)
    }
}

/// Raw handoff contract from source adapters into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDraft {
    pub id: String,
    pub title: String,
    pub address: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub price_text: Option<String>,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tenure: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Normalized listing record. Mutated by merge, enrichment and scoring, in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: String,
    pub address: String,
    pub price: Option<f64>,
    #[serde(default)]
    pub price_display: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tenure: Tenure,
    #[serde(default = "unknown_agent")]
    pub agent: String,
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(rename = "score", default)]
    pub investment_score: f64,
    #[serde(default)]
    pub category: Category,
    #[serde(default)]
    pub ai_summary: Option<String>,
    #[serde(default)]
    pub llm_score: Option<f64>,
    #[serde(default)]
    pub llm_reasoning: Option<String>,
    #[serde(default)]
    pub avg_area_price: Option<f64>,
    #[serde(default)]
    pub avg_area_rent: Option<f64>,
    #[serde(default)]
    pub roi: Option<f64>,
    #[serde(default)]
    pub discount: Option<f64>,
    #[serde(default)]
    pub image_url: Option<String>,
}

fn unknown_agent() -> String {
    "Unknown".to_string()
}

impl Listing {
    pub fn from_draft(draft: ListingDraft, source_id: &str, location: Option<&str>) -> Self {
        let price = draft
            .price
            .filter(|p| p.is_finite())
            .or_else(|| draft.price_text.as_deref().and_then(parse_price));
        let price_display = draft
            .price_text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| display_price(price));
        let tenure = draft
            .tenure
            .as_deref()
            .map(Tenure::from_text)
            .unwrap_or_default();
        let agent = draft
            .agent
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(unknown_agent);

        Self {
            id: draft.id,
            title: draft.title,
            address: draft.address,
            price,
            price_display,
            url: draft.url,
            description: draft.description,
            tenure,
            agent,
            source_id: source_id.to_string(),
            location: location.map(ToString::to_string),
            investment_score: 0.0,
            category: Category::Standard,
            ai_summary: None,
            llm_score: None,
            llm_reasoning: None,
            avg_area_price: None,
            avg_area_rent: None,
            roi: None,
            discount: None,
            image_url: draft.image_url.filter(|u| !u.trim().is_empty()),
        }
    }

    /// Restores the non-empty `price_display` invariant on records loaded from disk.
    pub fn ensure_price_display(&mut self) {
        if self.price_display.trim().is_empty() {
            self.price_display = display_price(self.price);
        }
    }

    /// Price if known and positive; zero and negative prices count as unknown.
    pub fn known_price(&self) -> Option<f64> {
        self.price.filter(|p| *p > 0.0)
    }
}

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.price_display, self.address)
    }
}

/// Extracts a whole-pound price from free text: `"£25,000 plus"` -> `25000`.
/// Pence after a decimal point are ignored.
pub fn parse_price(text: &str) -> Option<f64> {
    let whole = text.split('.').next().unwrap_or_default();
    let digits: String = whole.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<f64>().ok()
}

pub fn display_price(price: Option<f64>) -> String {
    match price {
        Some(p) if p.is_finite() => format_gbp(p),
        _ => "N/A".to_string(),
    }
}

/// `45000.0` -> `£45,000`.
pub fn format_gbp(amount: f64) -> String {
    let rounded = amount.round_ties_even().abs() as u64;
    let digits = rounded.to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0.0 {
        format!("-£{grouped}")
    } else {
        format!("£{grouped}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScoreStage {
    Base,
    Price,
    Roi,
    Penalty,
    Cap,
    Override,
    Land,
    Discount,
    Secondary,
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreStep {
    pub stage: ScoreStage,
    pub label: String,
    pub before: f64,
    pub after: f64,
}

/// Immutable record of score adjustments. Every operation consumes the ledger and
/// returns a new one, so each stage can be exercised on its own.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreLedger {
    value: f64,
    steps: Vec<ScoreStep>,
}

impl ScoreLedger {
    pub fn start(stage: ScoreStage, label: impl Into<String>, value: f64) -> Self {
        Self {
            value,
            steps: vec![ScoreStep {
                stage,
                label: label.into(),
                before: 0.0,
                after: value,
            }],
        }
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn steps(&self) -> &[ScoreStep] {
        &self.steps
    }

    pub fn add(self, stage: ScoreStage, label: impl Into<String>, delta: f64) -> Self {
        let after = self.value + delta;
        self.record(stage, label, after)
    }

    /// Adds `delta` and clamps into `[min, max]` at this point.
    pub fn add_clamped(
        self,
        stage: ScoreStage,
        label: impl Into<String>,
        delta: f64,
        min: f64,
        max: f64,
    ) -> Self {
        let after = (self.value + delta).clamp(min, max);
        self.record(stage, label, after)
    }

    /// Lowers the value to `max` if above it. No step is recorded when nothing changes.
    pub fn cap(self, stage: ScoreStage, label: impl Into<String>, max: f64) -> Self {
        if self.value > max {
            self.record(stage, label, max)
        } else {
            self
        }
    }

    /// Raises the value to `min` if below it. No step is recorded when nothing changes.
    pub fn floor(self, stage: ScoreStage, label: impl Into<String>, min: f64) -> Self {
        if self.value < min {
            self.record(stage, label, min)
        } else {
            self
        }
    }

    pub fn force(self, stage: ScoreStage, label: impl Into<String>, value: f64) -> Self {
        self.record(stage, label, value)
    }

    fn record(mut self, stage: ScoreStage, label: impl Into<String>, after: f64) -> Self {
        self.steps.push(ScoreStep {
            stage,
            label: label.into(),
            before: self.value,
            after,
        });
        self.value = after;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchedOn {
    Id,
    Url,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedDuplicate {
    pub id: String,
    pub url: String,
    pub source_id: String,
    pub kept_id: String,
    pub matched_on: MatchedOn,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub kept: Vec<Listing>,
    pub dropped: Vec<DroppedDuplicate>,
}

/// Deduplicates by identity: two records are the same listing if they share a
/// non-blank `id` or a non-blank `url`. The first record seen wins; callers that
/// want a different representative must order the input by priority first.
pub fn merge_by_identity(listings: Vec<Listing>) -> MergeOutcome {
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut by_url: HashMap<String, usize> = HashMap::new();
    let mut outcome = MergeOutcome::default();

    for listing in listings {
        let id_key = identity_key(&listing.id);
        let url_key = identity_key(&listing.url);

        let existing = id_key
            .and_then(|k| by_id.get(k).map(|idx| (*idx, MatchedOn::Id)))
            .or_else(|| url_key.and_then(|k| by_url.get(k).map(|idx| (*idx, MatchedOn::Url))));

        if let Some((idx, matched_on)) = existing {
            outcome.dropped.push(DroppedDuplicate {
                id: listing.id.clone(),
                url: listing.url.clone(),
                source_id: listing.source_id.clone(),
                kept_id: outcome.kept[idx].id.clone(),
                matched_on,
            });
            continue;
        }

        let idx = outcome.kept.len();
        if let Some(k) = id_key {
            by_id.insert(k.to_string(), idx);
        }
        if let Some(k) = url_key {
            by_url.insert(k.to_string(), idx);
        }
        outcome.kept.push(listing);
    }

    outcome
}

fn identity_key(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

//! Deterministic investment scoring: keyword signals, the staged rule table,
//! ranking, and the secondary-scorer seam.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use spf_core::{format_gbp, Category, Listing, ScoreLedger, ScoreStage};

mod secondary;

pub use secondary::{
    apply_secondary, score_top_n, RuleScorer, ScorerError, SecondaryReport, SecondaryScore, SecondaryScorer,
};

pub const CRATE_NAME: &str = "spf-scoring";

pub const RATIONALE_MAX_CHARS: usize = 200;

pub const SEVERE_DISTRESS_TERMS: &[&str] = &[
    "fire damage",
    "derelict",
    "uninhabitable",
    "unlivable",
    "unliveable",
    "condemned",
    "structural",
    "subsidence",
    "gutted",
    "shell",
    "unsafe",
    "dangerous",
    "rebuild",
    "major works",
    "complete renovation",
];

pub const MEDIUM_WORKS_TERMS: &[&str] = &[
    "modernisation",
    "modernization",
    "refurbishment",
    "renovation",
    "updating",
    "project",
    "in need of",
    "requires",
];

/// Auction phrases matched as substrings. "lot" is matched separately as a word.
pub const AUCTION_TERMS: &[&str] = &[
    "auction",
    "guide price",
    "starting bid",
    "buyers premium",
    "buyer's premium",
    "reserve price",
];

pub const CAVEAT_TERMS: &[&str] = &[
    "cash buyers only",
    "cash buyer only",
    "tenant in situ",
    "tenanted",
    "shared ownership",
    "short lease",
    "leasehold",
    "subject to contract",
    "buyers premium",
    "buyer's premium",
];

static LOT_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\blot\b").expect("lot pattern compiles"));
static LAND_TITLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^land\b").expect("land pattern compiles"));

fn contains_any(text: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| text.contains(n))
}

/// The listing fields scoring reads. Borrowed so callers can score without cloning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListingAttributes<'a> {
    pub title: &'a str,
    pub description: &'a str,
    pub agent: &'a str,
    pub address: &'a str,
    pub price: Option<f64>,
    pub roi: Option<f64>,
}

impl<'a> From<&'a Listing> for ListingAttributes<'a> {
    fn from(listing: &'a Listing) -> Self {
        Self {
            title: &listing.title,
            description: &listing.description,
            agent: &listing.agent,
            address: &listing.address,
            price: listing.price,
            roi: listing.roi,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Signals {
    pub severe_distress: bool,
    pub medium_works: bool,
    pub auction: bool,
    pub caveat: bool,
    pub land: bool,
    pub tenanted: bool,
    pub shared_ownership: bool,
    pub cash_only: bool,
    pub leasehold: bool,
}

impl Signals {
    pub fn detect(attrs: &ListingAttributes<'_>) -> Self {
        let text = format!("{} {} {}", attrs.title, attrs.description, attrs.agent).to_lowercase();
        Self {
            severe_distress: contains_any(&text, SEVERE_DISTRESS_TERMS),
            medium_works: contains_any(&text, MEDIUM_WORKS_TERMS),
            auction: contains_any(&text, AUCTION_TERMS) || LOT_WORD.is_match(&text),
            caveat: contains_any(&text, CAVEAT_TERMS),
            land: is_land(attrs.title, attrs.address),
            tenanted: contains_any(&text, &["tenant in situ", "tenanted"]),
            shared_ownership: text.contains("shared ownership"),
            cash_only: contains_any(&text, &["cash buyers only", "cash buyer only"]),
            leasehold: contains_any(&text, &["leasehold", "short lease"]),
        }
    }
}

pub fn is_land(title: &str, address: &str) -> bool {
    let title = title.trim().to_lowercase();
    let address = address.to_lowercase();
    let phrases = ["land for sale", "plot of land"];
    contains_any(&title, &phrases) || contains_any(&address, &phrases) || LAND_TITLE.is_match(&title)
}

/// Price and ROI gates for the top two tiers.
#[derive(Debug, Clone, Copy)]
pub struct TierThresholds {
    pub ten_price_max: f64,
    pub ten_roi_min: f64,
    pub nine_price_max: f64,
    pub nine_roi_min: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            ten_price_max: 50_000.0,
            ten_roi_min: 200.0,
            nine_price_max: 60_000.0,
            nine_roi_min: 150.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreCard {
    pub score: u8,
    pub category: Category,
    pub rationale: String,
    pub signals: Signals,
    pub ledger: ScoreLedger,
}

impl ScoreCard {
    /// Writes score, category and rationale onto the listing, replacing any
    /// previous values.
    pub fn apply_to(&self, listing: &mut Listing) {
        listing.investment_score = f64::from(self.score);
        listing.category = self.category;
        listing.ai_summary = Some(self.rationale.clone());
    }
}

/// Pure function of the listing attributes: same input, same card.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoringEngine {
    pub thresholds: TierThresholds,
}

impl ScoringEngine {
    pub fn new(thresholds: TierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn score_listing(&self, listing: &Listing) -> ScoreCard {
        self.score(&ListingAttributes::from(listing))
    }

    pub fn score(&self, attrs: &ListingAttributes<'_>) -> ScoreCard {
        let signals = Signals::detect(attrs);
        let price = attrs.price.filter(|p| *p > 0.0);
        let roi = attrs.roi.filter(|r| *r > 0.0);
        let t = &self.thresholds;

        let clean_distress = signals.severe_distress && !signals.auction && !signals.caveat;
        let strict_ten = clean_distress
            && price.is_some_and(|p| p < t.ten_price_max)
            && roi.is_some_and(|r| r >= t.ten_roi_min);

        let mut ledger = if strict_ten {
            ScoreLedger::start(ScoreStage::Override, "strict top tier", 10.0)
        } else {
            let ledger = base_stage(&signals);
            let ledger = price_stage(ledger, price);
            let ledger = roi_stage(ledger, roi);
            let ledger = penalty_stage(ledger, &signals, price);
            let ledger = cap_stage(ledger, &signals);
            let relaxed_nine = clean_distress
                && price.is_some_and(|p| p < t.nine_price_max)
                && roi.is_some_and(|r| r >= t.nine_roi_min);
            if relaxed_nine {
                ledger.floor(ScoreStage::Override, "strong distress deal", 9.0)
            } else {
                ledger
            }
        };

        if signals.land {
            ledger = ledger.add(ScoreStage::Land, "land listing", -10.0);
        }
        let rounded = ledger.value().round_ties_even().clamp(1.0, 10.0);
        let ledger = ledger.force(ScoreStage::Final, "round and clamp", rounded);

        ScoreCard {
            score: rounded as u8,
            category: categorize(&signals),
            rationale: rationale(&signals, price, roi, strict_ten),
            signals,
            ledger,
        }
    }
}

fn base_stage(signals: &Signals) -> ScoreLedger {
    if signals.severe_distress {
        ScoreLedger::start(ScoreStage::Base, "severe distress", 7.0)
    } else if signals.medium_works {
        ScoreLedger::start(ScoreStage::Base, "needs work", 5.0)
    } else {
        ScoreLedger::start(ScoreStage::Base, "no major works", 3.0)
    }
}

fn price_stage(ledger: ScoreLedger, price: Option<f64>) -> ScoreLedger {
    let Some(price) = price else {
        return ledger.cap(ScoreStage::Price, "unknown price", 5.0);
    };
    let delta = if price < 50_000.0 {
        2.0
    } else if price < 60_000.0 {
        1.5
    } else if price < 80_000.0 {
        1.0
    } else if price < 100_000.0 {
        0.5
    } else if price > 120_000.0 {
        -1.0
    } else {
        return ledger;
    };
    ledger.add(ScoreStage::Price, format!("price {}", format_gbp(price)), delta)
}

fn roi_stage(ledger: ScoreLedger, roi: Option<f64>) -> ScoreLedger {
    let Some(roi) = roi else {
        return ledger;
    };
    let delta = if roi >= 200.0 {
        2.5
    } else if roi >= 150.0 {
        2.0
    } else if roi >= 120.0 {
        1.0
    } else if roi >= 100.0 {
        0.5
    } else if roi < 80.0 {
        -0.5
    } else {
        return ledger;
    };
    ledger.add(ScoreStage::Roi, format!("ROI {roi:.0}%"), delta)
}

fn penalty_stage(mut ledger: ScoreLedger, signals: &Signals, price: Option<f64>) -> ScoreLedger {
    if signals.auction && price.is_some_and(|p| p > 40_000.0) {
        ledger = ledger.add(ScoreStage::Penalty, "auction above £40,000", -3.0);
    }
    if signals.tenanted {
        ledger = ledger.add(ScoreStage::Penalty, "tenanted", -3.0);
    }
    if signals.shared_ownership {
        ledger = ledger.add(ScoreStage::Penalty, "shared ownership", -4.0);
    }
    if signals.cash_only {
        ledger = ledger.add(ScoreStage::Penalty, "cash buyers only", -2.0);
    }
    if signals.leasehold {
        ledger = ledger.add(ScoreStage::Penalty, "leasehold", -2.0);
    }
    ledger
}

fn cap_stage(mut ledger: ScoreLedger, signals: &Signals) -> ScoreLedger {
    if !signals.severe_distress {
        ledger = ledger.cap(ScoreStage::Cap, "no severe distress", 6.0);
    }
    if signals.auction {
        ledger = ledger.cap(ScoreStage::Cap, "auction", 7.0);
    }
    ledger
}

fn categorize(signals: &Signals) -> Category {
    if signals.land {
        Category::Land
    } else if signals.severe_distress {
        Category::Distressed
    } else if signals.medium_works {
        Category::FixerUpper
    } else {
        Category::Standard
    }
}

fn rationale(signals: &Signals, price: Option<f64>, roi: Option<f64>, strict_ten: bool) -> String {
    let mut reasons = Vec::new();
    if strict_ten && !signals.land {
        reasons.push("strict 10/10: under £50k, ROI at least 200%, severe distress, no auction or caveats".to_string());
    } else {
        if let Some(price) = price {
            reasons.push(format!("price {}", format_gbp(price.trunc())));
        }
        if let Some(roi) = roi {
            reasons.push(format!("ROI {roi:.0}%"));
        }
        let works = if signals.severe_distress {
            "severe distress"
        } else if signals.medium_works {
            "needs work"
        } else {
            "no major works signaled"
        };
        reasons.push(works.to_string());
        if signals.auction {
            reasons.push("auction mentioned".to_string());
        }
        if signals.caveat {
            reasons.push("caveats mentioned".to_string());
        }
    }
    if signals.land {
        reasons.push("land listing".to_string());
    }
    reasons.join(", ").chars().take(RATIONALE_MAX_CHARS).collect()
}

/// Score descending, then price ascending with unknown prices last. Stable.
pub fn rank_listings(listings: &mut [Listing]) {
    listings.sort_by(|a, b| {
        b.investment_score
            .total_cmp(&a.investment_score)
            .then_with(|| match (a.known_price(), b.known_price()) {
                (Some(pa), Some(pb)) => pa.total_cmp(&pb),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
    });
}

use async_trait::async_trait;
use serde::Serialize;
use spf_core::{Listing, ScoreLedger, ScoreStage};
use thiserror::Error;
use tracing::{info, warn};

use crate::{ListingAttributes, ScoringEngine};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecondaryScore {
    pub score: f64,
    pub reasoning: String,
}

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("secondary scorer `{0}` is unavailable")]
    Unavailable(String),
    #[error("secondary scorer rejected listing: {0}")]
    Rejected(String),
}

/// A second opinion on a listing, applied to the top of the ranking only.
#[async_trait]
pub trait SecondaryScorer: Send + Sync {
    fn provider(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn score(&self, attrs: &ListingAttributes<'_>) -> Result<SecondaryScore, ScorerError>;
}

/// Re-runs the rule table over the enriched attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleScorer {
    engine: ScoringEngine,
}

impl RuleScorer {
    pub fn new(engine: ScoringEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl SecondaryScorer for RuleScorer {
    fn provider(&self) -> &str {
        "rules"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn score(&self, attrs: &ListingAttributes<'_>) -> Result<SecondaryScore, ScorerError> {
        let card = self.engine.score(attrs);
        Ok(SecondaryScore {
            score: f64::from(card.score),
            reasoning: card.rationale,
        })
    }
}

/// Records the secondary result and nudges the primary score: +1 for a 10,
/// +0.5 for a 9, clamped to `[0, 10]`.
pub fn apply_secondary(listing: &mut Listing, result: SecondaryScore) {
    let ledger = ScoreLedger::start(ScoreStage::Base, "current score", listing.investment_score);
    let ledger = if result.score >= 10.0 {
        ledger.add_clamped(ScoreStage::Secondary, "secondary 10", 1.0, 0.0, 10.0)
    } else if result.score >= 9.0 {
        ledger.add_clamped(ScoreStage::Secondary, "secondary 9", 0.5, 0.0, 10.0)
    } else {
        ledger
    };
    listing.investment_score = ledger.value();
    listing.llm_score = Some(result.score);
    listing.llm_reasoning = Some(result.reasoning);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SecondaryReport {
    pub provider: String,
    pub available: bool,
    pub scored: usize,
    pub failed: usize,
}

/// Scores the first `top_n` listings (callers rank first). An unavailable scorer
/// skips the pass; a per-listing failure leaves that listing untouched.
pub async fn score_top_n(listings: &mut [Listing], scorer: &dyn SecondaryScorer, top_n: usize) -> SecondaryReport {
    let mut report = SecondaryReport {
        provider: scorer.provider().to_string(),
        ..SecondaryReport::default()
    };
    if !scorer.is_available().await {
        warn!(provider = scorer.provider(), "secondary scorer unavailable; skipping");
        return report;
    }
    report.available = true;

    let take = top_n.min(listings.len());
    for (i, listing) in listings.iter_mut().take(take).enumerate() {
        if (i + 1) % 25 == 0 {
            info!(done = i + 1, of = take, "secondary scoring progress");
        }
        match scorer.score(&ListingAttributes::from(&*listing)).await {
            Ok(result) => {
                apply_secondary(listing, result);
                report.scored += 1;
            }
            Err(err) => {
                warn!(id = %listing.id, error = %err, "secondary scoring failed");
                report.failed += 1;
            }
        }
    }
    report
}

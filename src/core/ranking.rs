//! Multi-factor candidate ranking.
//!
//! Candidates are never filtered out. Soft preferences add a bonus on top of
//! the index similarity, and the pool is re-sorted by the combined score.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{Evidence, Locator, Modality, ScoredCandidate};

/// Retrieval over-fetch multiplier: the index is asked for `top_k * 5`
pub const OVERFETCH_FACTOR: usize = 5;

/// Number of candidates to request from the search expert
pub fn pool_size(top_k: usize) -> usize {
    top_k.max(1) * OVERFETCH_FACTOR
}

/// Soft preferences extracted from the question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    /// Substring of the preferred source asset id
    #[serde(default)]
    pub source: Option<String>,

    #[serde(default)]
    pub modality: Option<Modality>,

    /// Page or timestamp the user pointed at
    #[serde(default)]
    pub locator: Option<Locator>,
}

impl Preferences {
    /// Read the `preferences` object produced by the query refiner:
    /// `{asset_name, modality, target_page, timestamp}`, all optional
    pub fn from_hints(hints: &Value) -> Self {
        let source = hints["asset_name"]
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let modality = match hints["modality"].as_str().map(str::to_ascii_lowercase).as_deref() {
            Some("pdf" | "document") => Some(Modality::Document),
            Some("video") => Some(Modality::Video),
            _ => None,
        };

        let locator = match (hints["target_page"].as_u64(), hints["timestamp"].as_f64()) {
            (Some(page), _) => u32::try_from(page).ok().map(Locator::Page),
            (None, Some(seconds)) => Some(Locator::Timestamp(seconds)),
            (None, None) => None,
        };

        Self {
            source,
            modality,
            locator,
        }
    }
}

/// Bonus weights and locator tolerances
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankingWeights {
    pub source: f64,
    pub modality: f64,
    pub locator: f64,
    pub query_match: f64,
    pub content_heuristic: f64,

    /// Pages match only when equal
    pub page_epsilon: f64,

    /// Seconds
    pub timestamp_epsilon: f64,
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            source: 0.40,
            modality: 0.20,
            locator: 0.45,
            query_match: 0.10,
            content_heuristic: 0.05,
            page_epsilon: 0.01,
            timestamp_epsilon: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RankingEngine {
    weights: RankingWeights,
}

impl RankingEngine {
    pub fn new(weights: RankingWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &RankingWeights {
        &self.weights
    }

    /// Sum of all bonuses that apply to one candidate
    pub fn bonus(&self, query: &str, evidence: &Evidence, prefs: &Preferences) -> f64 {
        let w = &self.weights;
        let mut bonus = 0.0;

        if let Some(source) = prefs.source.as_deref().filter(|s| !s.is_empty()) {
            if contains_ignore_case(&evidence.source_asset_id, source) {
                bonus += w.source;
            }
        }

        if prefs.modality == Some(evidence.modality) {
            bonus += w.modality;
        }

        if let (Some(wanted), Some(actual)) = (prefs.locator, evidence.locator) {
            let epsilon = match wanted {
                Locator::Page(_) => w.page_epsilon,
                Locator::Timestamp(_) => w.timestamp_epsilon,
            };
            if wanted.distance(&actual).is_some_and(|d| d < epsilon) {
                bonus += w.locator;
            }
        }

        let query = query.trim();
        if !query.is_empty() && contains_ignore_case(&evidence.text_excerpt, query) {
            bonus += w.query_match;
        }

        let heuristic = match (evidence.modality, evidence.content_type.as_deref()) {
            (Modality::Video, Some("transcript_context")) => true,
            (Modality::Document, Some("heading" | "title")) => true,
            _ => false,
        };
        if heuristic {
            bonus += w.content_heuristic;
        }

        bonus
    }

    /// Score, stable-sort descending and keep the best `top_k`
    pub fn rank(
        &self,
        query: &str,
        candidates: Vec<Evidence>,
        prefs: &Preferences,
        top_k: usize,
    ) -> Vec<ScoredCandidate> {
        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|evidence| {
                let base_score = evidence.embedding_similarity;
                let bonus = self.bonus(query, &evidence, prefs);
                ScoredCandidate {
                    evidence,
                    base_score,
                    bonus,
                    final_score: base_score + bonus,
                }
            })
            .collect();

        // sort_by is stable; ties keep retrieval order
        scored.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        scored.truncate(top_k);
        scored
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evidence(source: &str, modality: Modality, locator: Option<Locator>, similarity: f64) -> Evidence {
        Evidence {
            modality,
            source_asset_id: source.to_string(),
            locator,
            bounding_region: None,
            content_type: None,
            text_excerpt: String::new(),
            embedding_similarity: similarity,
        }
    }

    #[test]
    fn test_pool_size() {
        assert_eq!(pool_size(5), 25);
        assert_eq!(pool_size(0), 5);
    }

    #[test]
    fn test_no_preferences_keeps_similarity_order() {
        let engine = RankingEngine::default();
        let ranked = engine.rank(
            "",
            vec![
                evidence("a", Modality::Document, None, 0.3),
                evidence("b", Modality::Document, None, 0.9),
                evidence("c", Modality::Video, None, 0.6),
            ],
            &Preferences::default(),
            2,
        );
        let ids: Vec<_> = ranked.iter().map(|c| c.evidence.source_asset_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(ranked.iter().all(|c| c.bonus == 0.0));
    }

    #[test]
    fn test_locator_units_must_match() {
        let engine = RankingEngine::default();
        let prefs = Preferences {
            locator: Some(Locator::Page(5)),
            ..Default::default()
        };
        let page = evidence("doc", Modality::Document, Some(Locator::Page(5)), 0.0);
        let stamp = evidence("vid", Modality::Video, Some(Locator::Timestamp(5.0)), 0.0);

        assert!((engine.bonus("", &page, &prefs) - 0.45).abs() < 1e-9);
        assert_eq!(engine.bonus("", &stamp, &prefs), 0.0);
    }

    #[test]
    fn test_heuristic_and_query_bonus() {
        let engine = RankingEngine::default();
        let mut ev = evidence("lecture", Modality::Video, None, 0.5);
        ev.content_type = Some("transcript_context".to_string());
        ev.text_excerpt = "Multi-Head Attention splits the model".to_string();

        let bonus = engine.bonus("multi-head attention", &ev, &Preferences::default());
        assert!((bonus - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_preferences_from_hints() {
        let prefs = Preferences::from_hints(&serde_json::json!({
            "asset_name": "Attention",
            "modality": "pdf",
            "target_page": 5,
            "timestamp": null
        }));
        assert_eq!(prefs.source.as_deref(), Some("Attention"));
        assert_eq!(prefs.modality, Some(Modality::Document));
        assert_eq!(prefs.locator, Some(Locator::Page(5)));

        assert_eq!(Preferences::from_hints(&Value::Null), Preferences::default());
    }

    #[test]
    fn test_ties_keep_input_order() {
        let engine = RankingEngine::default();
        let ranked = engine.rank(
            "",
            vec![
                evidence("first", Modality::Document, None, 0.5),
                evidence("second", Modality::Document, None, 0.5),
            ],
            &Preferences::default(),
            2,
        );
        assert_eq!(ranked[0].evidence.source_asset_id, "first");
    }
}

//! Retrieved evidence and ranked candidates.

use serde::{Deserialize, Serialize};

/// Modality of a retrieved fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    #[serde(alias = "pdf")]
    Document,
    Video,
}

/// Where in its source a fragment originates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Locator {
    /// Page number (documents)
    Page(u32),

    /// Seconds from the start (video)
    Timestamp(f64),
}

impl Locator {
    /// Absolute distance to another locator of the same unit; `None` when units differ
    pub fn distance(&self, other: &Locator) -> Option<f64> {
        match (self, other) {
            (Self::Page(a), Self::Page(b)) => Some((f64::from(*a) - f64::from(*b)).abs()),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some((a - b).abs()),
            _ => None,
        }
    }

    /// Display label: `p.5` or `mm:ss`
    pub fn label(&self) -> String {
        match self {
            Self::Page(page) => format!("p.{}", page),
            Self::Timestamp(seconds) => {
                let total = seconds.max(0.0) as u64;
                format!("{:02}:{:02}", total / 60, total % 60)
            }
        }
    }
}

/// A retrieved content fragment. Never mutated after retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub modality: Modality,

    /// Asset the fragment was cut from
    pub source_asset_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<Locator>,

    /// `[x0, y0, x1, y1]` on the page, documents only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_region: Option<[f64; 4]>,

    /// Fragment type reported by the index (e.g. `transcript_context`, `heading`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default)]
    pub text_excerpt: String,

    /// Similarity score from the vector index
    pub embedding_similarity: f64,
}

/// Evidence with its ranking breakdown. Recomputed per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub evidence: Evidence,
    pub base_score: f64,
    pub bonus: f64,
    pub final_score: f64,
}

/// Citation sent to the client with the final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub modality: Modality,
    pub source_asset_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_region: Option<[f64; 4]>,
}

impl From<&Evidence> for Citation {
    fn from(evidence: &Evidence) -> Self {
        Self {
            modality: evidence.modality,
            source_asset_id: evidence.source_asset_id.clone(),
            label: evidence.locator.map(|l| l.label()),
            bounding_region: evidence.bounding_region,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_distance_requires_same_unit() {
        assert_eq!(Locator::Page(5).distance(&Locator::Page(7)), Some(2.0));
        assert_eq!(Locator::Timestamp(12.5).distance(&Locator::Timestamp(12.0)), Some(0.5));
        assert_eq!(Locator::Page(5).distance(&Locator::Timestamp(5.0)), None);
    }

    #[test]
    fn test_locator_labels() {
        assert_eq!(Locator::Page(3).label(), "p.3");
        assert_eq!(Locator::Timestamp(125.7).label(), "02:05");
    }

    #[test]
    fn test_evidence_wire_format() {
        let json = r#"{
            "modality": "pdf",
            "source_asset_id": "attention.pdf",
            "locator": {"page": 5},
            "bounding_region": [0.1, 0.2, 0.8, 0.3],
            "text_excerpt": "Scaled dot-product attention",
            "embedding_similarity": 0.71
        }"#;
        let evidence: Evidence = serde_json::from_str(json).unwrap();
        assert_eq!(evidence.modality, Modality::Document);
        assert_eq!(evidence.locator, Some(Locator::Page(5)));
        assert!(evidence.content_type.is_none());
    }
}

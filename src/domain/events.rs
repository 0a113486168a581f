//! Event types.
//!
//! - [`AssetEvent`]: immutable records appended to the asset registry log.
//!   The current state of every asset is reconstructed by replaying them.
//! - [`TurnEvent`]: messages streamed to the caller while a reasoning turn runs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::{Asset, AssetStatus};
use super::evidence::Citation;

/// A single entry in the append-only asset log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetEvent {
    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    pub asset_id: String,

    #[serde(flatten)]
    pub kind: AssetEventKind,
}

/// What happened to the asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AssetEventKind {
    /// Asset created in `Uploading`
    Registered { asset: Asset },

    /// Asset moved forward to `status`
    Advanced {
        status: AssetStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processed_location: Option<PathBuf>,
    },

    /// Asset re-queued after a restart found it mid-pipeline
    Requeued,

    /// Asset moved to `Failed`
    Failed { reason: String },
}

impl AssetEvent {
    pub fn new(asset_id: impl Into<String>, kind: AssetEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            asset_id: asset_id.into(),
            kind,
        }
    }
}

/// Reasoning loop node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Research,
    Evaluate,
    Vision,
    Logic,
    Synthesize,
}

impl Node {
    /// Fixed successor used when a node simply continues
    pub fn successor(self) -> Option<Node> {
        match self {
            Self::Research => Some(Self::Evaluate),
            Self::Evaluate => Some(Self::Vision),
            Self::Vision => Some(Self::Logic),
            Self::Logic => Some(Self::Synthesize),
            Self::Synthesize => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Evaluate => "evaluate",
            Self::Vision => "vision",
            Self::Logic => "logic",
            Self::Synthesize => "synthesize",
        }
    }
}

/// Event streamed to the caller of a reasoning turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    /// The loop entered a node
    NodeStart { node: Node, message: String },

    /// One token of the final answer
    Token { content: String },

    /// The turn finished
    FinalResult {
        answer: String,
        citations: Vec<Citation>,
        status: String,
    },

    /// The turn failed or could not start
    Error { content: String },
}

impl TurnEvent {
    pub fn node_start(node: Node) -> Self {
        Self::NodeStart {
            node,
            message: format!("Agent entering: {}", node.as_str()),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    /// Serialize as a single JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"event":"error","content":"unserializable event: {}"}}"#, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::asset::AssetKind;

    #[test]
    fn test_asset_event_serialization() {
        let event = AssetEvent::new(
            "doc1",
            AssetEventKind::Advanced {
                status: AssetStatus::Clipping,
                processed_location: Some(PathBuf::from("/processed/doc1")),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"advanced""#));
        let parsed: AssetEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_registered_event_carries_asset() {
        let asset = Asset::new("v1", AssetKind::Video, "/raw/v1.mp4");
        let event = AssetEvent::new("v1", AssetEventKind::Registered { asset: asset.clone() });
        let parsed: AssetEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(parsed.kind, AssetEventKind::Registered { asset });
    }

    #[test]
    fn test_turn_event_wire_format() {
        let json = TurnEvent::node_start(Node::Evaluate).to_json();
        assert!(json.contains(r#""event":"node_start""#));
        assert!(json.contains(r#""node":"evaluate""#));

        let token = TurnEvent::Token {
            content: "Hi".to_string(),
        };
        assert_eq!(token.to_json(), r#"{"event":"token","content":"Hi"}"#);
    }
}

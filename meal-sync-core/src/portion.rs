//! Portion ledger vocabulary.
//!
//! A portion event is one immutable row in the append-only ledger of a
//! stock-like resource (a prepped meal). The derived remaining count is
//! `originalPortions + sum(deltaPortions)` and is never negative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of quantity-affecting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortionKind {
    Consumed,
    Discarded,
    Expired,
    Adjusted,
}

impl PortionKind {
    /// Only ADJUSTED may carry a positive delta.
    pub fn allows_positive_delta(self) -> bool {
        matches!(self, PortionKind::Adjusted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortionKind::Consumed => "CONSUMED",
            PortionKind::Discarded => "DISCARDED",
            PortionKind::Expired => "EXPIRED",
            PortionKind::Adjusted => "ADJUSTED",
        }
    }

    /// Domain event type emitted when a row of this kind is appended.
    pub fn event_type(self) -> &'static str {
        match self {
            PortionKind::Consumed => "portion.consumed",
            PortionKind::Discarded => "portion.discarded",
            PortionKind::Expired => "portion.expired",
            PortionKind::Adjusted => "portion.adjusted",
        }
    }
}

impl std::str::FromStr for PortionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONSUMED" => Ok(PortionKind::Consumed),
            "DISCARDED" => Ok(PortionKind::Discarded),
            "EXPIRED" => Ok(PortionKind::Expired),
            "ADJUSTED" => Ok(PortionKind::Adjusted),
            other => Err(format!("unknown portion kind '{}'", other)),
        }
    }
}

/// One immutable ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortionEvent {
    /// Server-assigned id.
    pub portion_event_id: String,
    pub resource_id: String,
    pub kind: PortionKind,
    /// Non-zero; negative for all kinds except ADJUSTED.
    pub delta_portions: i64,
    /// Client-observed time of the real-world event.
    pub occurred_at: DateTime<Utc>,
    /// Server time; immutable once assigned.
    pub recorded_at: DateTime<Utc>,
    /// Strictly increasing, gap-free per resource; server-assigned.
    pub sequence: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_delta_policy() {
        assert!(PortionKind::Adjusted.allows_positive_delta());
        assert!(!PortionKind::Consumed.allows_positive_delta());
        assert!(!PortionKind::Discarded.allows_positive_delta());
        assert!(!PortionKind::Expired.allows_positive_delta());
    }

    #[test]
    fn test_kind_string_roundtrip() {
        for kind in [
            PortionKind::Consumed,
            PortionKind::Discarded,
            PortionKind::Expired,
            PortionKind::Adjusted,
        ] {
            assert_eq!(kind.as_str().parse::<PortionKind>().unwrap(), kind);
        }
        assert!("EATEN".parse::<PortionKind>().is_err());
    }

    #[test]
    fn test_event_wire_format() {
        let event = PortionEvent {
            portion_event_id: "pe1".into(),
            resource_id: "pm1".into(),
            kind: PortionKind::Consumed,
            delta_portions: -2,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            sequence: 1,
            idempotency_key: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "CONSUMED");
        assert_eq!(json["deltaPortions"], -2);
        assert!(json.get("idempotencyKey").is_none());
    }
}

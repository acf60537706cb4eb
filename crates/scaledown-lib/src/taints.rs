//! Scale-down taints on nodes and the `key: "value:Effect"` encoding used by pool templates

use crate::models::{Node, Taint, TaintEffect};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

/// Marks a node the actuator is about to remove. Value is the Unix timestamp of the decision.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

/// Soft marker for nodes the planner considers unneeded. Value is a Unix timestamp.
pub const DELETION_CANDIDATE_TAINT: &str = "DeletionCandidateOfClusterAutoscaler";

pub fn to_be_deleted_taint(now: DateTime<Utc>) -> Taint {
    Taint::new(
        TO_BE_DELETED_TAINT,
        now.timestamp().to_string(),
        TaintEffect::NoSchedule,
    )
}

pub fn deletion_candidate_taint(now: DateTime<Utc>) -> Taint {
    Taint::new(
        DELETION_CANDIDATE_TAINT,
        now.timestamp().to_string(),
        TaintEffect::PreferNoSchedule,
    )
}

pub fn has_to_be_deleted_taint(node: &Node) -> bool {
    node.taint(TO_BE_DELETED_TAINT).is_some()
}

pub fn has_deletion_candidate_taint(node: &Node) -> bool {
    node.taint(DELETION_CANDIDATE_TAINT).is_some()
}

/// Timestamp carried by the to-be-deleted taint; `None` if absent or unparseable
pub fn to_be_deleted_time(node: &Node) -> Option<DateTime<Utc>> {
    taint_time(node, TO_BE_DELETED_TAINT)
}

pub fn deletion_candidate_time(node: &Node) -> Option<DateTime<Utc>> {
    taint_time(node, DELETION_CANDIDATE_TAINT)
}

fn taint_time(node: &Node, key: &str) -> Option<DateTime<Utc>> {
    let taint = node.taint(key)?;
    let secs: i64 = taint.value.parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

/// Parses pool taints. The effect is the last `:`-separated segment; a value is kept only when
/// exactly one separator is present. Entries with an unknown effect are dropped.
pub fn parse_taints(taints: &HashMap<String, String>) -> Vec<Taint> {
    let mut parsed: Vec<Taint> = taints
        .iter()
        .filter_map(|(key, value_effect)| {
            let segments: Vec<&str> = value_effect.split(':').collect();
            let effect = TaintEffect::parse(segments.last()?)?;
            let value = if segments.len() == 2 { segments[0] } else { "" };
            Some(Taint::new(key.clone(), value, effect))
        })
        .collect();
    parsed.sort_by(|a, b| a.key.cmp(&b.key));
    parsed
}

pub fn serialize_taints(taints: &[Taint]) -> HashMap<String, String> {
    taints
        .iter()
        .map(|taint| {
            let encoded = if taint.value.is_empty() {
                taint.effect.as_str().to_string()
            } else {
                format!("{}:{}", taint.value, taint.effect.as_str())
            };
            (taint.key.clone(), encoded)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_taints() {
        let parsed = parse_taints(&map(&[
            ("k1", "v1:NoSchedule"),
            ("k2", "NoExecute"),
            ("k3", "a:b:PreferNoSchedule"),
            ("k4", "v4:Bogus"),
            ("k5", ""),
        ]));

        assert_eq!(
            parsed,
            vec![
                Taint::new("k1", "v1", TaintEffect::NoSchedule),
                Taint::new("k2", "", TaintEffect::NoExecute),
                Taint::new("k3", "", TaintEffect::PreferNoSchedule),
            ]
        );
    }

    #[test]
    fn test_serialized_taints_parse_back() {
        let mut taints = vec![
            Taint::new("dedicated", "ml", TaintEffect::NoSchedule),
            Taint::new("spot", "", TaintEffect::PreferNoSchedule),
            Taint::new("drain", "soon", TaintEffect::NoExecute),
        ];
        taints.sort_by(|a, b| a.key.cmp(&b.key));

        assert_eq!(parse_taints(&serialize_taints(&taints)), taints);
    }

    #[test]
    fn test_to_be_deleted_time() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut node = Node::new("n1");
        assert!(to_be_deleted_time(&node).is_none());

        node.taints.push(to_be_deleted_taint(now));
        assert!(has_to_be_deleted_taint(&node));
        assert!(!has_deletion_candidate_taint(&node));
        assert_eq!(to_be_deleted_time(&node), Some(now));

        node.taints[0].value = "not-a-number".into();
        assert!(to_be_deleted_time(&node).is_none());
    }
}

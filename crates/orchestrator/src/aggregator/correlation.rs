//! Failure correlation: group failed steps across devices by normalized error text

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use tandem_common::CollaborativeExecutionResult;

/// Heuristic root cause of a failure pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Timeout,
    ElementNotFound,
    Network,
    Permission,
    CrossDevice,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Timeout => write!(f, "timeout"),
            FailureCause::ElementNotFound => write!(f, "element not found"),
            FailureCause::Network => write!(f, "network"),
            FailureCause::Permission => write!(f, "permission"),
            FailureCause::CrossDevice => write!(f, "cross-device issue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedStepRef {
    pub device: String,
    pub step_index: usize,
}

/// Failures sharing one normalized error pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePattern {
    pub pattern: String,
    pub occurrences: usize,
    /// Distinct devices, first-seen order
    pub affected_devices: Vec<String>,
    pub steps: Vec<FailedStepRef>,
    /// First raw error text that produced this pattern
    pub sample_error: String,
    pub likely_cause: Option<FailureCause>,
}

struct Normalizer {
    timestamp: Regex,
    uuid: Regex,
    quoted: Regex,
    integer: Regex,
    whitespace: Regex,
}

fn normalizer() -> &'static Normalizer {
    static NORMALIZER: OnceLock<Normalizer> = OnceLock::new();
    NORMALIZER.get_or_init(|| Normalizer {
        timestamp: Regex::new(
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?|\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b",
        )
        .unwrap(),
        uuid: Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap(),
        quoted: Regex::new(r#""[^"]*"|'[^']*'"#).unwrap(),
        integer: Regex::new(r"\b\d+\b").unwrap(),
        whitespace: Regex::new(r"\s+").unwrap(),
    })
}

/// Replace volatile tokens with placeholders so equivalent failures compare equal
pub fn normalize_error(message: &str) -> String {
    let n = normalizer();
    let text = n.timestamp.replace_all(message, "<timestamp>");
    let text = n.uuid.replace_all(&text, "<uuid>");
    let text = n.quoted.replace_all(&text, "<string>");
    let text = n.integer.replace_all(&text, "<n>");
    n.whitespace.replace_all(text.trim(), " ").into_owned()
}

/// Keyword heuristics first, then the cross-device fallback
pub fn infer_cause(pattern: &str, affected_devices: usize) -> Option<FailureCause> {
    let text = pattern.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["timeout", "timed out"]) {
        Some(FailureCause::Timeout)
    } else if has(&["not found", "no such element", "unable to locate", "no element"]) {
        Some(FailureCause::ElementNotFound)
    } else if has(&["network", "connection refused", "connection reset", "econn", "net::", "dns"]) {
        Some(FailureCause::Network)
    } else if has(&["permission", "denied", "forbidden", "unauthorized"]) {
        Some(FailureCause::Permission)
    } else if affected_devices > 1 {
        Some(FailureCause::CrossDevice)
    } else {
        None
    }
}

/// Group every failed step by normalized pattern, most frequent first
pub fn correlate(result: &CollaborativeExecutionResult) -> Vec<FailurePattern> {
    let mut patterns: Vec<FailurePattern> = Vec::new();
    let mut by_pattern: HashMap<String, usize> = HashMap::new();

    for device in &result.devices {
        for (step_index, step) in device.steps.iter().enumerate() {
            if step.result.success {
                continue;
            }
            let error = step.result.error.as_deref().unwrap_or("unknown error");
            let pattern = normalize_error(error);

            let slot = *by_pattern.entry(pattern.clone()).or_insert_with(|| {
                patterns.push(FailurePattern {
                    pattern,
                    occurrences: 0,
                    affected_devices: Vec::new(),
                    steps: Vec::new(),
                    sample_error: error.to_string(),
                    likely_cause: None,
                });
                patterns.len() - 1
            });

            let entry = &mut patterns[slot];
            entry.occurrences += 1;
            if !entry.affected_devices.contains(&device.alias) {
                entry.affected_devices.push(device.alias.clone());
            }
            entry.steps.push(FailedStepRef {
                device: device.alias.clone(),
                step_index,
            });
        }
    }

    for entry in &mut patterns {
        entry.likely_cause = infer_cause(&entry.pattern, entry.affected_devices.len());
    }

    // stable, so equal counts keep first-seen order
    patterns.sort_by(|a, b| b.occurrences.cmp(&a.occurrences));
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_replaces_volatile_tokens() {
        assert_eq!(
            normalize_error("Element not found: #submit-123"),
            "Element not found: #submit-<n>"
        );
        assert_eq!(
            normalize_error("at 2024-03-01T10:15:30.123Z   request 550e8400-e29b-41d4-a716-446655440000 failed"),
            "at <timestamp> request <uuid> failed"
        );
        assert_eq!(
            normalize_error(r#"expected title "Cart (3)", got 'Cart'"#),
            "expected title <string>, got <string>"
        );
    }

    #[test]
    fn test_cause_keywords_win_over_cross_device() {
        assert_eq!(infer_cause("Timeout <n>ms exceeded", 3), Some(FailureCause::Timeout));
        assert_eq!(infer_cause("Element not found: #x", 2), Some(FailureCause::ElementNotFound));
        assert_eq!(infer_cause("net::ERR_CONNECTION_REFUSED", 1), Some(FailureCause::Network));
        assert_eq!(infer_cause("Permission denied", 1), Some(FailureCause::Permission));
        assert_eq!(infer_cause("balance mismatch", 2), Some(FailureCause::CrossDevice));
        assert_eq!(infer_cause("balance mismatch", 1), None);
    }
}

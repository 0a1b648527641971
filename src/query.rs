//! Comparator-expression matching for natural-language search.
//!
//! A small heuristic, not a query language: queries like `"BP < 80"` or
//! `"heart rate > 100"` are matched against a record's measurement map by
//! taking the last word before the operator as the parameter name,
//! substring-matching it against measurement keys, and comparing against
//! the leading numeric token of the measurement value. `"bp 120"` (no
//! operator) matches on near-equality.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn comparator_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*([<>=]+)\s*(\d+)").unwrap())
}

fn plain_value_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)\s*(\d+)").unwrap())
}

fn numeric_token_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+\.?\d*").unwrap())
}

/// Equality comparisons tolerate this much absolute difference.
const EQUALITY_TOLERANCE: f64 = 0.1;

/// Whether a free-text query expresses a measurement comparison satisfied
/// by some entry of `measurements`.
///
/// Measurement keys match on case-insensitive substring containment of the
/// parameter name; values contribute their first numeric token (so
/// `"120/80 mmHg"` compares as `120`). Unknown operators never match.
pub fn matches_measurement_query(query: &str, measurements: &BTreeMap<String, String>) -> bool {
    let query_lower = query.to_lowercase();

    // Comparator form first, then the bare "<name> <number>" form.
    if let Some(caps) = comparator_pattern().captures(&query_lower) {
        let param = &caps[1];
        let op = caps[2].to_string();
        if let Ok(value) = caps[3].parse::<f64>() {
            if any_measurement_satisfies(measurements, param, Some(&op), value) {
                return true;
            }
        }
    }

    if let Some(caps) = plain_value_pattern().captures(&query_lower) {
        let param = &caps[1];
        if let Ok(value) = caps[2].parse::<f64>() {
            if any_measurement_satisfies(measurements, param, None, value) {
                return true;
            }
        }
    }

    false
}

fn any_measurement_satisfies(
    measurements: &BTreeMap<String, String>,
    param: &str,
    op: Option<&str>,
    value: f64,
) -> bool {
    for (name, measured) in measurements {
        if !name.to_lowercase().contains(param) {
            continue;
        }
        let Some(measured_num) = leading_number(measured) else {
            continue;
        };
        let satisfied = match op {
            Some("<") => measured_num < value,
            Some(">") => measured_num > value,
            Some("=") | Some("==") => (measured_num - value).abs() < EQUALITY_TOLERANCE,
            Some(_) => false,
            None => (measured_num - value).abs() < EQUALITY_TOLERANCE,
        };
        if satisfied {
            return true;
        }
    }
    false
}

/// First numeric token of a measurement value string.
fn leading_number(value: &str) -> Option<f64> {
    numeric_token_pattern()
        .find(value)
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn measurements(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn greater_than_on_leading_token() {
        let m = measurements(&[("Heart Rate", "102 bpm")]);
        assert!(matches_measurement_query("heart rate > 100", &m));
        assert!(!matches_measurement_query("heart rate > 150", &m));
    }

    #[test]
    fn less_than_and_compound_value() {
        let m = measurements(&[("BP", "120/80 mmHg")]);
        // leading token is 120
        assert!(matches_measurement_query("bp < 130", &m));
        assert!(!matches_measurement_query("bp < 80", &m));
        assert!(matches_measurement_query("bp > 110", &m));
    }

    #[test]
    fn equality_with_tolerance() {
        let m = measurements(&[("Hemoglobin", "12.05 g/dL")]);
        assert!(matches_measurement_query("hemoglobin = 12", &m));
        assert!(!matches_measurement_query("hemoglobin = 13", &m));
    }

    #[test]
    fn bare_value_query_means_equality() {
        let m = measurements(&[("Glucose", "98 mg/dL")]);
        assert!(matches_measurement_query("glucose 98", &m));
        assert!(!matches_measurement_query("glucose 99", &m));
    }

    #[test]
    fn parameter_matches_by_substring_case_insensitive() {
        let m = measurements(&[("Resting Heart Rate", "60 bpm")]);
        assert!(matches_measurement_query("rate < 70", &m));
        assert!(!matches_measurement_query("pressure < 70", &m));
    }

    #[test]
    fn non_numeric_measurement_never_matches() {
        let m = measurements(&[("Blood Type", "O positive")]);
        assert!(!matches_measurement_query("blood > 1", &m));
    }

    #[test]
    fn plain_text_query_does_not_match() {
        let m = measurements(&[("BP", "120/80 mmHg")]);
        assert!(!matches_measurement_query("who has hypertension", &m));
    }
}

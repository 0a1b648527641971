//! Patient-level aggregation.
//!
//! Merges an arbitrary number of per-image records into one
//! [`PatientAnalysis`]. Measurement values accumulate per name in record
//! order; duplicates across records are kept, since repeated readings are
//! a time series. The list-valued fields are unioned and de-duplicated by
//! first occurrence, preserving order.

use std::collections::BTreeMap;

use crate::models::{ClinicalRecord, PatientAnalysis};

/// Merge records into a patient analysis. Empty input yields the empty
/// analysis, not an error.
pub fn aggregate(records: &[ClinicalRecord]) -> PatientAnalysis {
    if records.is_empty() {
        return PatientAnalysis::default();
    }

    let mut measurements: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut abnormalities = Vec::new();
    let mut prescriptions = Vec::new();
    let mut exercises = Vec::new();
    let mut dietary = Vec::new();
    let mut recommendations = Vec::new();

    for record in records {
        for (name, value) in &record.measurements {
            measurements
                .entry(name.clone())
                .or_default()
                .push(value.clone());
        }
        abnormalities.extend(record.abnormalities.iter().cloned());
        prescriptions.extend(record.prescriptions.iter().cloned());
        exercises.extend(record.exercises.iter().cloned());
        dietary.extend(record.dietary.iter().cloned());
        recommendations.extend(record.recommendations.iter().cloned());
    }

    PatientAnalysis {
        total_reports: records.len(),
        measurements,
        abnormalities: dedup_first_seen(abnormalities),
        prescriptions: dedup_first_seen(prescriptions),
        exercises: dedup_first_seen(exercises),
        dietary: dedup_first_seen(dietary),
        recommendations: dedup_first_seen(recommendations),
        summary_text: format!(
            "Comprehensive analysis based on {} report(s).",
            records.len()
        ),
    }
}

/// Stable, order-preserving dedup by exact string equality.
fn dedup_first_seen(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_with(abnormalities: &[&str], measurements: &[(&str, &str)]) -> ClinicalRecord {
        ClinicalRecord {
            abnormalities: abnormalities.iter().map(|s| s.to_string()).collect(),
            measurements: measurements
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_input_yields_empty_analysis() {
        let analysis = aggregate(&[]);
        assert_eq!(analysis, PatientAnalysis::default());
        assert!(analysis.is_empty());
    }

    #[test]
    fn abnormality_union_keeps_first_seen_order() {
        let records = vec![
            record_with(&["A", "B"], &[]),
            record_with(&["B", "C"], &[]),
        ];
        let analysis = aggregate(&records);
        assert_eq!(analysis.abnormalities, vec!["A", "B", "C"]);
        assert_eq!(analysis.total_reports, 2);
    }

    #[test]
    fn measurement_multiplicity_preserved() {
        let records = vec![
            record_with(&[], &[("BP", "120/80")]),
            record_with(&[], &[("BP", "120/80")]),
        ];
        let analysis = aggregate(&records);
        assert_eq!(analysis.measurements["BP"], vec!["120/80", "120/80"]);
    }

    #[test]
    fn measurement_values_accumulate_in_record_order() {
        let records = vec![
            record_with(&[], &[("Heart Rate", "72 bpm")]),
            record_with(&[], &[("Heart Rate", "88 bpm"), ("BP", "130/85")]),
        ];
        let analysis = aggregate(&records);
        assert_eq!(analysis.measurements["Heart Rate"], vec!["72 bpm", "88 bpm"]);
        assert_eq!(analysis.measurements["BP"], vec!["130/85"]);
    }

    #[test]
    fn summary_line_counts_reports() {
        let analysis = aggregate(&[ClinicalRecord::default()]);
        assert_eq!(
            analysis.summary_text,
            "Comprehensive analysis based on 1 report(s)."
        );
    }

    #[test]
    fn all_list_fields_are_deduped() {
        let mut a = ClinicalRecord::default();
        a.prescriptions = vec!["P1".into(), "P1".into()];
        a.exercises = vec!["E1".into()];
        a.dietary = vec!["D1".into()];
        a.recommendations = vec!["R1".into()];
        let mut b = ClinicalRecord::default();
        b.prescriptions = vec!["P1".into(), "P2".into()];
        b.exercises = vec!["E1".into(), "E2".into()];
        b.dietary = vec!["D1".into()];
        b.recommendations = vec!["R2".into(), "R1".into()];

        let analysis = aggregate(&[a, b]);
        assert_eq!(analysis.prescriptions, vec!["P1", "P2"]);
        assert_eq!(analysis.exercises, vec!["E1", "E2"]);
        assert_eq!(analysis.dietary, vec!["D1"]);
        assert_eq!(analysis.recommendations, vec!["R1", "R2"]);
    }
}

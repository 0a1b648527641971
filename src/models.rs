//! Core data models for the scan pipeline.
//!
//! These types flow between the image store, the extraction client, the
//! record store, and the aggregation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A downloaded, normalized medical report image.
///
/// Construction happens in [`crate::gcs`] on download; the pixel data has
/// already been flattened to opaque RGB and re-encoded as PNG, so every
/// consumer sees one deterministic representation regardless of the stored
/// format. Transient: discarded once extraction finishes.
#[derive(Debug, Clone)]
pub struct ImageBlob {
    /// Full object key in the bucket (`<patient>/<filename>`).
    pub path: String,
    /// Normalized pixels, PNG-encoded.
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Byte size of the stored object (pre-normalization).
    pub stored_size: u64,
    /// Content type declared by the store, if any.
    pub content_type: Option<String>,
}

/// Structured output of one extraction attempt, keyed by
/// (patient, image filename) in the record store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClinicalRecord {
    pub patient_name: String,
    /// Filename only (last path segment).
    pub image_name: String,
    /// Full object key in the bucket.
    pub image_path: String,
    /// Freeform clinical summary. On parse fallback this is the raw model
    /// reply; on extraction failure it is an error description.
    pub summary: String,
    /// Measurement name → value string (e.g. `"BP" → "120/80 mmHg"`).
    pub measurements: BTreeMap<String, String>,
    pub abnormalities: Vec<String>,
    pub prescriptions: Vec<String>,
    pub exercises: Vec<String>,
    pub dietary: Vec<String>,
    pub recommendations: Vec<String>,
    /// Which model actually served the request (after any fallback).
    pub model_used: String,
    /// UTC time the extraction ran. In-memory only; the record store
    /// stamps its own server-assigned times on persistence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_at: Option<DateTime<Utc>>,
    /// Server-assigned creation time, set by the record store on read.
    pub created_at: Option<DateTime<Utc>>,
    /// Server-assigned update time, set by the record store on read.
    pub updated_at: Option<DateTime<Utc>>,
    /// Raw string form of the creation time when it did not parse.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_raw: Option<String>,
    /// Best-effort object-store metadata captured at scan time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_metadata: Option<serde_json::Value>,
    /// Non-empty when extraction failed. Error records are returned to the
    /// orchestrator but never persisted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClinicalRecord {
    /// Whether this record represents a failed extraction.
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Derived, non-persisted aggregate over all of one patient's records.
///
/// Recomputed on every load by [`crate::aggregate::aggregate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PatientAnalysis {
    pub total_reports: usize,
    /// Measurement name → every value seen, in record order. Duplicates are
    /// kept: this is a multi-reading series, not a set.
    pub measurements: BTreeMap<String, Vec<String>>,
    pub abnormalities: Vec<String>,
    pub prescriptions: Vec<String>,
    pub exercises: Vec<String>,
    pub dietary: Vec<String>,
    pub recommendations: Vec<String>,
    pub summary_text: String,
}

impl PatientAnalysis {
    pub fn is_empty(&self) -> bool {
        self.total_reports == 0
    }
}

/// One successfully processed image within a scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanSuccess {
    pub image_path: String,
    pub doc_id: String,
    pub summary: String,
}

/// One image that failed at some stage of the scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanFailure {
    pub image_path: String,
    pub reason: String,
}

/// Per-invocation summary of a patient scan.
///
/// Invariant: `processed + failed == total_images` once the scan returns,
/// no matter which stages failed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanOutcome {
    pub patient_name: String,
    pub total_images: usize,
    pub processed: usize,
    pub failed: usize,
    pub successes: Vec<ScanSuccess>,
    pub failures: Vec<ScanFailure>,
}

/// Extract the filename portion of an object key.
///
/// `"patient1/report.png"` → `"report.png"`. Keys without a separator are
/// returned unchanged.
pub fn image_filename(image_path: &str) -> &str {
    image_path.rsplit('/').next().unwrap_or(image_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_key() {
        assert_eq!(image_filename("alice/report.png"), "report.png");
        assert_eq!(image_filename("a/b/c.jpg"), "c.jpg");
        assert_eq!(image_filename("bare.png"), "bare.png");
    }

    #[test]
    fn error_record_detection() {
        let mut rec = ClinicalRecord::default();
        assert!(!rec.is_error());
        rec.error = Some(String::new());
        assert!(!rec.is_error());
        rec.error = Some("quota exceeded".into());
        assert!(rec.is_error());
    }
}

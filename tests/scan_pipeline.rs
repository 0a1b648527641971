//! End-to-end tests for the scan orchestrator using in-memory stores.
//!
//! The fakes here implement the same adapter traits as the GCS, Gemini,
//! and Firestore clients, so these tests exercise the exact control flow
//! production runs through, minus the network.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use carelens::aggregate::aggregate;
use carelens::firestore::record_doc_id;
use carelens::models::{image_filename, ClinicalRecord, ImageBlob};
use carelens::progress::NoProgress;
use carelens::scan::scan_patient;
use carelens::traits::{DownloadError, Extractor, ImageStore, RecordStore, StoreError};

// ============ In-memory fakes ============

#[derive(Default)]
struct MemImages {
    /// Object keys, returned in this order.
    images: Vec<String>,
    fail_download: HashSet<String>,
    fail_metadata: bool,
}

impl MemImages {
    fn with_images(paths: &[&str]) -> Self {
        Self {
            images: paths.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ImageStore for MemImages {
    async fn list_patients(&self) -> anyhow::Result<Vec<String>> {
        let mut patients: Vec<String> = self
            .images
            .iter()
            .filter_map(|k| k.split_once('/').map(|(p, _)| p.to_string()))
            .collect();
        patients.sort();
        patients.dedup();
        Ok(patients)
    }

    async fn list_images(&self, patient: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .images
            .iter()
            .filter(|k| k.starts_with(&format!("{}/", patient)))
            .cloned()
            .collect())
    }

    async fn download_image(&self, image_path: &str) -> Result<ImageBlob, DownloadError> {
        if self.fail_download.contains(image_path) {
            return Err(DownloadError::Transport {
                path: image_path.to_string(),
                reason: "connection reset".to_string(),
            });
        }
        Ok(ImageBlob {
            path: image_path.to_string(),
            png: vec![0x89, 0x50, 0x4e, 0x47],
            width: 1,
            height: 1,
            stored_size: 4,
            content_type: Some("image/png".to_string()),
        })
    }

    async fn get_metadata(&self, image_path: &str) -> anyhow::Result<serde_json::Value> {
        if self.fail_metadata {
            anyhow::bail!("metadata unavailable");
        }
        Ok(serde_json::json!({ "name": image_path, "size": 4 }))
    }

    async fn upload_image(
        &self,
        patient: &str,
        filename: &str,
        _bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> anyhow::Result<String> {
        Ok(format!("{}/{}", patient.trim(), filename))
    }
}

/// Extractor that returns an error-bearing record for configured paths and
/// a fixed successful record otherwise.
#[derive(Default)]
struct MemExtractor {
    fail_paths: HashSet<String>,
}

#[async_trait]
impl Extractor for MemExtractor {
    async fn extract(&self, image: &ImageBlob) -> ClinicalRecord {
        let mut record = ClinicalRecord {
            image_name: image_filename(&image.path).to_string(),
            image_path: image.path.clone(),
            model_used: "fake-model".to_string(),
            ..Default::default()
        };
        if self.fail_paths.contains(&image.path) {
            record.summary = "Error analyzing image: model unavailable".to_string();
            record.error = Some("model unavailable".to_string());
        } else {
            record.summary = format!("Findings for {}", image.path);
            record
                .measurements
                .insert("Heart Rate".to_string(), "102 bpm".to_string());
            record.abnormalities.push("Elevated heart rate".to_string());
        }
        record
    }
}

#[derive(Default)]
struct MemRecords {
    saved: Mutex<BTreeMap<String, ClinicalRecord>>,
    fail_save: bool,
}

impl MemRecords {
    fn saved_ids(&self) -> Vec<String> {
        self.saved.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl RecordStore for MemRecords {
    async fn save(&self, record: &ClinicalRecord) -> Result<String, StoreError> {
        if self.fail_save {
            return Err(StoreError::Transport("store offline".to_string()));
        }
        let doc_id = record_doc_id(&record.patient_name, &record.image_path);
        self.saved
            .lock()
            .unwrap()
            .insert(doc_id.clone(), record.clone());
        Ok(doc_id)
    }

    async fn get_patient_records(&self, patient: &str) -> Result<Vec<ClinicalRecord>, StoreError> {
        Ok(self
            .saved
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.patient_name == patient)
            .cloned()
            .collect())
    }

    async fn search_by_query(&self, query: &str) -> Result<Vec<ClinicalRecord>, StoreError> {
        let query_lower = query.to_lowercase();
        let all: Vec<ClinicalRecord> = self.saved.lock().unwrap().values().cloned().collect();
        Ok(all
            .into_iter()
            .filter(|r| r.summary.to_lowercase().contains(&query_lower))
            .collect())
    }

    async fn list_all_patients(&self) -> Result<Vec<String>, StoreError> {
        let mut patients: Vec<String> = self
            .saved
            .lock()
            .unwrap()
            .values()
            .map(|r| r.patient_name.clone())
            .collect();
        patients.sort();
        patients.dedup();
        Ok(patients)
    }
}

// ============ Scan pipeline ============

#[tokio::test]
async fn clean_scan_processes_every_image() {
    let images = MemImages::with_images(&["alice/a.png", "alice/b.png", "alice/c.png"]);
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    let outcome = scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    assert_eq!(outcome.total_images, 3);
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(
        records.saved_ids(),
        vec!["alice_a.png", "alice_b.png", "alice_c.png"]
    );
}

#[tokio::test]
async fn download_failure_skips_only_that_image() {
    let mut images = MemImages::with_images(&["alice/a.png", "alice/b.png"]);
    images.fail_download.insert("alice/a.png".to_string());
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    let outcome = scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.processed + outcome.failed, outcome.total_images);
    assert_eq!(outcome.failures[0].image_path, "alice/a.png");
    assert!(outcome.failures[0].reason.starts_with("download failed"));
    assert_eq!(records.saved_ids(), vec!["alice_b.png"]);
}

#[tokio::test]
async fn extraction_error_records_are_never_persisted() {
    let images = MemImages::with_images(&["alice/a.png", "alice/b.png"]);
    let mut extractor = MemExtractor::default();
    extractor.fail_paths.insert("alice/b.png".to_string());
    let records = MemRecords::default();

    let outcome = scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.failed, 1);
    assert!(outcome.failures[0]
        .reason
        .contains("extraction failed: model unavailable"));
    // The failed extraction must leave no document behind.
    assert_eq!(records.saved_ids(), vec!["alice_a.png"]);
}

#[tokio::test]
async fn persist_failure_is_counted_not_fatal() {
    let images = MemImages::with_images(&["alice/a.png", "alice/b.png"]);
    let extractor = MemExtractor::default();
    let records = MemRecords {
        fail_save: true,
        ..Default::default()
    };

    let outcome = scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.failed, 2);
    assert!(outcome
        .failures
        .iter()
        .all(|f| f.reason.starts_with("persist failed")));
}

#[tokio::test]
async fn metadata_failure_does_not_fail_the_image() {
    let mut images = MemImages::with_images(&["alice/a.png"]);
    images.fail_metadata = true;
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    let outcome = scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.failed, 0);
    // The empty-mapping substitute still gets stored.
    let saved = records.saved.lock().unwrap();
    assert_eq!(saved["alice_a.png"].image_metadata, Some(serde_json::json!({})));
}

#[tokio::test]
async fn empty_folder_yields_zero_counts() {
    let images = MemImages::default();
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    let outcome = scan_patient(&images, &extractor, &records, &NoProgress, "nobody")
        .await
        .unwrap();

    assert_eq!(outcome.total_images, 0);
    assert_eq!(outcome.processed, 0);
    assert_eq!(outcome.failed, 0);
    assert!(records.saved_ids().is_empty());
}

#[tokio::test]
async fn rescanning_overwrites_instead_of_duplicating() {
    let images = MemImages::with_images(&["alice/a.png"]);
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();
    scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    assert_eq!(records.saved_ids(), vec!["alice_a.png"]);
}

#[tokio::test]
async fn scan_stamps_patient_and_metadata_on_stored_records() {
    let images = MemImages::with_images(&["alice/a.png"]);
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    let saved = records.saved.lock().unwrap();
    let stored = &saved["alice_a.png"];
    assert_eq!(stored.patient_name, "alice");
    assert_eq!(stored.image_name, "a.png");
    assert_eq!(
        stored.image_metadata,
        Some(serde_json::json!({ "name": "alice/a.png", "size": 4 }))
    );
}

// ============ Scan then aggregate ============

#[tokio::test]
async fn scanned_records_aggregate_into_patient_analysis() {
    let images = MemImages::with_images(&["alice/a.png", "alice/b.png"]);
    let extractor = MemExtractor::default();
    let records = MemRecords::default();

    scan_patient(&images, &extractor, &records, &NoProgress, "alice")
        .await
        .unwrap();

    let stored = records.get_patient_records("alice").await.unwrap();
    let analysis = aggregate(&stored);

    assert_eq!(analysis.total_reports, 2);
    // Both readings kept as a series.
    assert_eq!(
        analysis.measurements["Heart Rate"],
        vec!["102 bpm", "102 bpm"]
    );
    // Identical abnormality strings are de-duplicated.
    assert_eq!(analysis.abnormalities, vec!["Elevated heart rate"]);
    assert!(analysis.summary_text.contains("2 report(s)"));
}

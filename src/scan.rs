//! Per-patient scan orchestration.
//!
//! Drives the full pipeline for one patient: list images, then for each
//! image download → fetch metadata → extract → persist, accumulating
//! per-image outcomes. The loop is strictly sequential, and no image's
//! failure aborts it: one bad image must never lose results from the
//! others. Persistence is an upsert on `<patient>_<filename>`, so
//! re-running a scan is idempotent for already-succeeded images and a
//! half-completed scan keeps its partial progress.
//!
//! Stage handling per image:
//!
//! | Stage | On failure |
//! |-------|-----------|
//! | download | record failure, continue |
//! | metadata | substitute empty mapping, continue normally |
//! | extract | error-bearing record → failure, continue, never persisted |
//! | persist | record failure, continue |

use anyhow::Result;
use tracing::{error, info, warn};

use crate::models::{ScanFailure, ScanOutcome, ScanSuccess};
use crate::progress::{ScanProgressEvent, ScanProgressReporter};
use crate::traits::{Extractor, ImageStore, RecordStore};

/// Scan every image in a patient's folder and persist the successful
/// extractions.
///
/// Always returns an outcome with `processed + failed == total_images`;
/// a patient with zero images yields all-zero counts, not an error. Only
/// the initial listing can fail the call as a whole (connectivity-class
/// failure, no per-image work has started yet).
pub async fn scan_patient(
    images: &dyn ImageStore,
    extractor: &dyn Extractor,
    records: &dyn RecordStore,
    progress: &dyn ScanProgressReporter,
    patient: &str,
) -> Result<ScanOutcome> {
    progress.report(ScanProgressEvent::Listing {
        patient: patient.to_string(),
    });

    let image_paths = images.list_images(patient).await?;

    let mut outcome = ScanOutcome {
        patient_name: patient.to_string(),
        total_images: image_paths.len(),
        ..Default::default()
    };

    for (idx, image_path) in image_paths.iter().enumerate() {
        progress.report(ScanProgressEvent::Processing {
            patient: patient.to_string(),
            image_path: image_path.clone(),
            n: idx + 1,
            total: image_paths.len(),
        });

        let blob = match images.download_image(image_path).await {
            Ok(blob) => blob,
            Err(e) => {
                error!(image = %image_path, error = %e, "download failed");
                fail(&mut outcome, image_path, format!("download failed: {}", e));
                continue;
            }
        };

        // Metadata is best-effort and must never abort the image.
        let metadata = match images.get_metadata(image_path).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(image = %image_path, error = %e, "could not get metadata");
                serde_json::json!({})
            }
        };

        let mut record = extractor.extract(&blob).await;
        if let Some(err) = record.error.as_deref().filter(|e| !e.is_empty()) {
            error!(image = %image_path, error = err, "extraction failed");
            fail(&mut outcome, image_path, format!("extraction failed: {}", err));
            continue;
        }

        record.patient_name = patient.to_string();
        record.image_metadata = Some(metadata);

        let doc_id = match records.save(&record).await {
            Ok(id) => id,
            Err(e) => {
                error!(image = %image_path, error = %e, "persist failed");
                fail(&mut outcome, image_path, format!("persist failed: {}", e));
                continue;
            }
        };

        outcome.processed += 1;
        outcome.successes.push(ScanSuccess {
            image_path: image_path.clone(),
            doc_id,
            summary: record.summary.clone(),
        });
    }

    progress.report(ScanProgressEvent::Done {
        patient: patient.to_string(),
        processed: outcome.processed,
        failed: outcome.failed,
    });

    info!(
        patient,
        total = outcome.total_images,
        processed = outcome.processed,
        failed = outcome.failed,
        "scan complete"
    );

    Ok(outcome)
}

fn fail(outcome: &mut ScanOutcome, image_path: &str, reason: String) {
    outcome.failed += 1;
    outcome.failures.push(ScanFailure {
        image_path: image_path.to_string(),
        reason,
    });
}

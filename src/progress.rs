//! Scan progress reporting.
//!
//! Reports observable progress while a patient scan runs, so users see
//! which image is being processed and how much is left. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event during a patient scan.
#[derive(Clone, Debug)]
pub enum ScanProgressEvent {
    /// Enumerating the patient's images (total not yet known).
    Listing { patient: String },
    /// Processing image `n` of `total`.
    Processing {
        patient: String,
        image_path: String,
        n: usize,
        total: usize,
    },
    /// The loop finished; counts match the returned outcome.
    Done {
        patient: String,
        processed: usize,
        failed: usize,
    },
}

/// Reports scan progress. Implementations write to stderr (human or JSON).
pub trait ScanProgressReporter: Send + Sync {
    fn report(&self, event: ScanProgressEvent);
}

/// Human-friendly progress: `scan alice  processing 2/7: alice/scan2.png`.
pub struct StderrProgress;

impl ScanProgressReporter for StderrProgress {
    fn report(&self, event: ScanProgressEvent) {
        let line = match &event {
            ScanProgressEvent::Listing { patient } => {
                format!("scan {}  listing images...\n", patient)
            }
            ScanProgressEvent::Processing {
                patient,
                image_path,
                n,
                total,
            } => format!("scan {}  processing {}/{}: {}\n", patient, n, total, image_path),
            ScanProgressEvent::Done {
                patient,
                processed,
                failed,
            } => format!(
                "scan {}  done  {} processed, {} failed\n",
                patient, processed, failed
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ScanProgressReporter for JsonProgress {
    fn report(&self, event: ScanProgressEvent) {
        let obj = match &event {
            ScanProgressEvent::Listing { patient } => serde_json::json!({
                "event": "progress",
                "patient": patient,
                "phase": "listing",
            }),
            ScanProgressEvent::Processing {
                patient,
                image_path,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "patient": patient,
                "phase": "processing",
                "image": image_path,
                "n": n,
                "total": total,
            }),
            ScanProgressEvent::Done {
                patient,
                processed,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "patient": patient,
                "phase": "done",
                "processed": processed,
                "failed": failed,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ScanProgressReporter for NoProgress {
    fn report(&self, _event: ScanProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode. Caller passes it to the scan.
    pub fn reporter(&self) -> Box<dyn ScanProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

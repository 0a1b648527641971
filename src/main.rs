//! # CareLens CLI (`carelens`)
//!
//! The `carelens` binary drives the scan pipeline from the command line:
//! listing patients and images, running scans, printing aggregated patient
//! reports, searching records, and uploading new images.
//!
//! ## Usage
//!
//! ```bash
//! carelens --config ./config/carelens.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `carelens patients` | List patient folders in the bucket (or `--from records`) |
//! | `carelens images <patient>` | List a patient's stored report images |
//! | `carelens scan <patient>` | Extract and persist records for every image |
//! | `carelens report <patient>` | Print the aggregated patient analysis |
//! | `carelens search "<query>"` | Free-text / numeric search across all records |
//! | `carelens upload <patient> <file>` | Upload a new report image |
//! | `carelens status` | Probe connectivity to both stores |
//!
//! Secrets come from the environment: `GEMINI_API_KEY` for the model,
//! `GOOGLE_ACCESS_TOKEN` for GCS and Firestore.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use carelens::aggregate::aggregate;
use carelens::config;
use carelens::firestore::FirestoreStore;
use carelens::gcs::GcsImageStore;
use carelens::gemini::GeminiClient;
use carelens::models::{PatientAnalysis, ScanOutcome};
use carelens::progress::ProgressMode;
use carelens::scan::scan_patient;
use carelens::status;
use carelens::traits::{ImageStore, RecordStore};

/// CareLens: per-patient medical report scanning and aggregation.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/carelens.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "carelens",
    about = "CareLens: scan per-patient medical report images into structured, queryable clinical records",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/carelens.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List patient names.
    ///
    /// By default derives patient folders from the image bucket; with
    /// `--from records` lists patients that have stored clinical records.
    Patients {
        /// Where to list from: `bucket` or `records`.
        #[arg(long, default_value = "bucket")]
        from: String,
    },

    /// List a patient's stored report images.
    Images {
        /// Patient folder name.
        patient: String,
    },

    /// Scan a patient's folder: download each image, extract structured
    /// findings, persist the record. One image's failure never aborts the
    /// rest; re-running overwrites existing records rather than
    /// duplicating them.
    Scan {
        /// Patient folder name.
        patient: String,

        /// Progress output: `auto`, `off`, `human`, or `json`.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// Print the aggregated analysis for one patient.
    Report {
        /// Patient name.
        patient: String,
    },

    /// Search all records with a free-text or numeric query
    /// (e.g. `"anemia"`, `"heart rate > 100"`). Returns one record per
    /// matching patient.
    Search {
        /// The query string.
        query: String,
    },

    /// Upload a new report image into a patient's folder.
    Upload {
        /// Patient folder name.
        patient: String,

        /// Path to the image file.
        file: PathBuf,

        /// Content type; inferred from the file extension when omitted.
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Probe connectivity to the image store and the record store.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("carelens=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Patients { from } => match from.as_str() {
            "bucket" => {
                let store = GcsImageStore::new(&cfg)?;
                for patient in store.list_patients().await? {
                    println!("{}", patient);
                }
            }
            "records" => {
                let store = FirestoreStore::new(&cfg)?;
                for patient in store.list_all_patients().await? {
                    println!("{}", patient);
                }
            }
            other => anyhow::bail!("Unknown source: '{}'. Use bucket or records.", other),
        },
        Commands::Images { patient } => {
            let store = GcsImageStore::new(&cfg)?;
            for image in store.list_images(&patient).await? {
                println!("{}", image);
            }
        }
        Commands::Scan { patient, progress } => {
            let images = GcsImageStore::new(&cfg)?;
            let extractor = GeminiClient::new(&cfg)?;
            let records = FirestoreStore::new(&cfg)?;
            let reporter = parse_progress_mode(&progress)?.reporter();

            let outcome =
                scan_patient(&images, &extractor, &records, reporter.as_ref(), &patient).await?;
            print_outcome(&outcome);
        }
        Commands::Report { patient } => {
            let store = FirestoreStore::new(&cfg)?;
            let records = store.get_patient_records(&patient).await?;
            let analysis = aggregate(&records);
            print_report(&patient, &analysis);
        }
        Commands::Search { query } => {
            let store = FirestoreStore::new(&cfg)?;
            let results = store.search_by_query(&query).await?;
            if results.is_empty() {
                println!("No results.");
            } else {
                for record in &results {
                    println!("{}  [{}]", record.patient_name, record.image_name);
                    println!("    {}", snippet(&record.summary, 200));
                }
            }
        }
        Commands::Upload {
            patient,
            file,
            content_type,
        } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("Invalid file name")?;
            let content_type = content_type.unwrap_or_else(|| {
                mime_guess::from_path(&file).first_or_octet_stream().to_string()
            });

            let store = GcsImageStore::new(&cfg)?;
            let path = store
                .upload_image(&patient, filename, bytes, Some(&content_type))
                .await?;
            println!("uploaded {}", path);
        }
        Commands::Status => {
            status::print_status(&cfg).await?;
        }
    }

    Ok(())
}

fn parse_progress_mode(mode: &str) -> Result<ProgressMode> {
    match mode {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => anyhow::bail!(
            "Unknown progress mode: '{}'. Use auto, off, human, or json.",
            other
        ),
    }
}

fn print_outcome(outcome: &ScanOutcome) {
    println!("scan {}", outcome.patient_name);
    println!("  images found: {}", outcome.total_images);
    println!("  processed: {}", outcome.processed);
    println!("  failed: {}", outcome.failed);
    for success in &outcome.successes {
        println!("  ok   {}  ({})", success.image_path, success.doc_id);
    }
    for failure in &outcome.failures {
        println!("  fail {}  {}", failure.image_path, failure.reason);
    }
}

fn print_report(patient: &str, analysis: &PatientAnalysis) {
    if analysis.is_empty() {
        println!("No records for patient '{}'. Run a scan first.", patient);
        return;
    }

    println!("Patient: {}", patient);
    println!("{}", analysis.summary_text);

    if !analysis.measurements.is_empty() {
        println!("\nMeasurements:");
        for (name, values) in &analysis.measurements {
            println!("  {}: {}", name, values.join(", "));
        }
    }
    print_section("Abnormalities", &analysis.abnormalities);
    if !analysis.prescriptions.is_empty() {
        // Prescription strings carry no disclaimer of their own; show the
        // clinical disclaimer once, here.
        println!("\nPrescriptions (suggestions only; consult a clinician):");
        for item in &analysis.prescriptions {
            println!("  - {}", item);
        }
    }
    print_section("Exercises", &analysis.exercises);
    print_section("Dietary", &analysis.dietary);
    print_section("Recommendations", &analysis.recommendations);
}

fn print_section(title: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    println!("\n{}:", title);
    for item in items {
        println!("  - {}", item);
    }
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}

//! # CareLens
//!
//! Per-patient medical report scanning and aggregation.
//!
//! CareLens lists a patient's report images in Google Cloud Storage,
//! extracts structured clinical findings from each image with Gemini,
//! persists the results as Firestore documents, and merges them into one
//! de-duplicated patient-level analysis answerable by free-text query.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────┐
//! │  GCS bucket │──▶│ Scan pipeline │──▶│ Firestore  │
//! │ patient/img │   │ extract+save │   │  records   │
//! └─────────────┘   └──────────────┘   └─────┬──────┘
//!                                            │
//!                         ┌──────────────────┤
//!                         ▼                  ▼
//!                   ┌───────────┐     ┌───────────┐
//!                   │ aggregate │     │  search   │
//!                   │  report   │     │ (NL query)│
//!                   └───────────┘     └───────────┘
//! ```
//!
//! The pipeline is strictly sequential per patient and isolates failures
//! per image: one bad image never loses results from the others, and
//! persistence is an idempotent upsert keyed by `<patient>_<filename>`.
//!
//! ## Quick Start
//!
//! ```bash
//! carelens status                       # probe both stores
//! carelens upload alice report1.png     # add an image
//! carelens scan alice                   # extract + persist records
//! carelens report alice                 # aggregated patient view
//! carelens search "heart rate > 100"    # free-text / numeric query
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration + environment secrets |
//! | [`models`] | Core data types |
//! | [`traits`] | Adapter seams (`ImageStore`, `Extractor`, `RecordStore`) |
//! | [`gcs`] | GCS image store adapter |
//! | [`normalize`] | Image decode + alpha/palette flattening |
//! | [`gemini`] | Gemini extraction client |
//! | [`firestore`] | Firestore record store adapter |
//! | [`query`] | Comparator-expression measurement matching |
//! | [`scan`] | Per-patient scan orchestration |
//! | [`aggregate`] | Patient-level aggregation |
//! | [`progress`] | Scan progress reporting |
//! | [`status`] | Connectivity probes for both stores |

pub mod aggregate;
pub mod config;
pub mod firestore;
pub mod gcs;
pub mod gemini;
pub mod models;
pub mod normalize;
pub mod progress;
pub mod query;
pub mod scan;
pub mod status;
pub mod traits;

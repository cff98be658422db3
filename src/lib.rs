// src/lib.rs
pub mod client;
pub mod constants;
pub mod count;
pub mod discovery;
pub mod download;
pub mod fhir;
pub mod measure;
pub mod stats;
pub mod upload;

// Re-export main types
pub use client::{Auth, FhirClient, OperationOutcomeError, RequestStats, TimedResponse};
pub use count::{count_resources, render_counts};
pub use discovery::{BundleIdentifier, DiscoveredBundle, FileKind, discover_bundles};
pub use download::{CommandStats, DownloadBundle, PageStats, expand_pages, write_resources};
pub use fhir::{ErrorResponse, OperationOutcome};
pub use measure::{MeasureFile, evaluate_measure_with_retry, read_measure_file};
pub use stats::{DurationStatistics, calculate_duration_statistics};
pub use upload::{BundleUploadResult, NoProgress, UploadProgress, UploadSummary, upload_bundles};
